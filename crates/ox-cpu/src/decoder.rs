//! PPC instruction decoder
//!
//! Classifies a 32-bit big-endian word into its instruction form and
//! extracts per-form fields. Primary opcode is bits 0-5; extended
//! opcodes sit at positions that depend on the form.

/// Decoded instruction
#[derive(Debug, Clone, Copy)]
pub struct DecodedInstruction {
    /// Raw opcode
    pub opcode: u32,
    /// Primary opcode (bits 0-5)
    pub op: u8,
    /// Extended opcode (position depends on form)
    pub xo: u16,
    /// Instruction form
    pub form: InstructionForm,
}

/// PPC instruction forms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionForm {
    /// Unconditional branch
    I,
    /// Conditional branch
    B,
    /// System call
    SC,
    /// Load/store/arith with displacement
    D,
    /// Load/store double with displacement
    DS,
    /// Indexed load/store, logical, misc
    X,
    /// Branch conditional to LR/CTR, CR logical
    XL,
    /// Move to/from SPR/CR
    XFX,
    /// Shift double immediate
    XS,
    /// Integer arithmetic
    XO,
    /// Floating-point multiply-add
    A,
    /// Rotate and mask (32-bit)
    M,
    /// Rotate and mask (64-bit, immediate)
    MD,
    /// Rotate and mask (64-bit, register shift)
    MDS,
    /// Vector three-operand
    VA,
    /// Vector two-operand
    VX,
    /// Unknown form
    Unknown,
}

/// X-form extended opcodes under primary 31 that are really XO-form
#[inline]
fn is_xo_arith(xo10: u16) -> bool {
    // XO-form has a 9-bit extended opcode; bit 9 of the 10-bit field is OE
    matches!(
        xo10 & 0x1FF,
        8 | 9 | 10 | 11 | 40 | 73 | 75 | 104 | 136 | 138 | 200 | 202 | 232 | 233 | 234 | 235
            | 266 | 457 | 459 | 489 | 491
    )
}

/// Stateless decoder
pub struct PpcDecoder;

impl PpcDecoder {
    /// Decode a 32-bit instruction word
    pub fn decode(opcode: u32) -> DecodedInstruction {
        let op = ((opcode >> 26) & 0x3F) as u8;

        let (form, xo) = match op {
            18 => (InstructionForm::I, 0),
            16 => (InstructionForm::B, 0),
            17 => (InstructionForm::SC, 0),

            // D-form: arith/logical/compare immediates and load/store
            2 | 3 | 7..=15 | 24..=29 | 32..=55 => (InstructionForm::D, 0),

            // DS-form: ld/ldu/lwa (58), std/stdu (62)
            58 | 62 => {
                let xo = (opcode & 0x3) as u16;
                (InstructionForm::DS, xo)
            }

            // XL-form: bclr/bcctr/CR logical/isync
            19 => {
                let xo = ((opcode >> 1) & 0x3FF) as u16;
                (InstructionForm::XL, xo)
            }

            // M-form rotates
            20..=23 => (InstructionForm::M, 0),

            // MD/MDS-form 64-bit rotates
            30 => {
                if (opcode >> 4) & 1 == 0 {
                    (InstructionForm::MD, ((opcode >> 2) & 0x7) as u16)
                } else {
                    (InstructionForm::MDS, ((opcode >> 1) & 0xF) as u16)
                }
            }

            // The big extended group: X, XO, XFX and XS share primary 31
            31 => {
                let xo10 = ((opcode >> 1) & 0x3FF) as u16;
                if is_xo_arith(xo10) {
                    (InstructionForm::XO, xo10 & 0x1FF)
                } else if matches!(xo10, 19 | 144 | 339 | 371 | 467) {
                    (InstructionForm::XFX, xo10)
                } else if xo10 >> 1 == 413 {
                    // sradi has a 9-bit opcode with sh[5] below it
                    (InstructionForm::XS, 413)
                } else {
                    (InstructionForm::X, xo10)
                }
            }

            // FP single/double; A-form when bit 26-30 is a multiply-add
            59 | 63 => {
                let xo5 = ((opcode >> 1) & 0x1F) as u16;
                if matches!(xo5, 18 | 20 | 21 | 22 | 23 | 24 | 25 | 26 | 28 | 29 | 30 | 31) {
                    (InstructionForm::A, xo5)
                } else {
                    (InstructionForm::X, ((opcode >> 1) & 0x3FF) as u16)
                }
            }

            // Vector ops: VA-form keeps a 6-bit opcode, VX an 11-bit one
            4 => {
                let xo6 = (opcode & 0x3F) as u16;
                if xo6 >= 32 && xo6 < 48 {
                    (InstructionForm::VA, xo6)
                } else {
                    (InstructionForm::VX, (opcode & 0x7FF) as u16)
                }
            }

            _ => (InstructionForm::Unknown, 0),
        };

        DecodedInstruction {
            opcode,
            op,
            xo,
            form,
        }
    }

    /// D-form: rt/rs, ra, signed displacement
    #[inline]
    pub fn d_form(opcode: u32) -> (u8, u8, i16) {
        let rt = ((opcode >> 21) & 0x1F) as u8;
        let ra = ((opcode >> 16) & 0x1F) as u8;
        let d = (opcode & 0xFFFF) as i16;
        (rt, ra, d)
    }

    /// DS-form: rt, ra, displacement scaled by 4
    #[inline]
    pub fn ds_form(opcode: u32) -> (u8, u8, i16) {
        let rt = ((opcode >> 21) & 0x1F) as u8;
        let ra = ((opcode >> 16) & 0x1F) as u8;
        let ds = (opcode & 0xFFFC) as i16;
        (rt, ra, ds)
    }

    /// X-form: rt/rs, ra, rb, rc
    #[inline]
    pub fn x_form(opcode: u32) -> (u8, u8, u8, bool) {
        let rt = ((opcode >> 21) & 0x1F) as u8;
        let ra = ((opcode >> 16) & 0x1F) as u8;
        let rb = ((opcode >> 11) & 0x1F) as u8;
        let rc = (opcode & 1) != 0;
        (rt, ra, rb, rc)
    }

    /// XO-form: rt, ra, rb, oe, rc
    #[inline]
    pub fn xo_form(opcode: u32) -> (u8, u8, u8, bool, bool) {
        let rt = ((opcode >> 21) & 0x1F) as u8;
        let ra = ((opcode >> 16) & 0x1F) as u8;
        let rb = ((opcode >> 11) & 0x1F) as u8;
        let oe = ((opcode >> 10) & 1) != 0;
        let rc = (opcode & 1) != 0;
        (rt, ra, rb, oe, rc)
    }

    /// I-form: sign-extended branch displacement, AA, LK
    #[inline]
    pub fn i_form(opcode: u32) -> (i32, bool, bool) {
        let li = ((opcode >> 2) & 0xFF_FFFF) as i32;
        let li = if li & 0x80_0000 != 0 {
            li | !0xFF_FFFF
        } else {
            li
        } << 2;
        let aa = ((opcode >> 1) & 1) != 0;
        let lk = (opcode & 1) != 0;
        (li, aa, lk)
    }

    /// B-form: bo, bi, sign-extended displacement, AA, LK
    #[inline]
    pub fn b_form(opcode: u32) -> (u8, u8, i16, bool, bool) {
        let bo = ((opcode >> 21) & 0x1F) as u8;
        let bi = ((opcode >> 16) & 0x1F) as u8;
        let bd = ((opcode >> 2) & 0x3FFF) as i16;
        let bd = if bd & 0x2000 != 0 { bd | !0x3FFF } else { bd } << 2;
        let aa = ((opcode >> 1) & 1) != 0;
        let lk = (opcode & 1) != 0;
        (bo, bi, bd, aa, lk)
    }

    /// M-form: rs, ra, sh/rb, mb, me, rc
    #[inline]
    pub fn m_form(opcode: u32) -> (u8, u8, u8, u8, u8, bool) {
        let rs = ((opcode >> 21) & 0x1F) as u8;
        let ra = ((opcode >> 16) & 0x1F) as u8;
        let rb = ((opcode >> 11) & 0x1F) as u8;
        let mb = ((opcode >> 6) & 0x1F) as u8;
        let me = ((opcode >> 1) & 0x1F) as u8;
        let rc = (opcode & 1) != 0;
        (rs, ra, rb, mb, me, rc)
    }

    /// MD-form: rs, ra, 6-bit sh, 6-bit mb/me, rc
    #[inline]
    pub fn md_form(opcode: u32) -> (u8, u8, u8, u8, bool) {
        let rs = ((opcode >> 21) & 0x1F) as u8;
        let ra = ((opcode >> 16) & 0x1F) as u8;
        let sh = (((opcode >> 11) & 0x1F) | ((opcode >> 1) & 0x20)) as u8;
        let mb = (((opcode >> 6) & 0x1F) | (opcode & 0x20)) as u8;
        let rc = (opcode & 1) != 0;
        (rs, ra, sh, mb, rc)
    }

    /// MDS-form: rs, ra, rb, 6-bit mb/me, rc
    #[inline]
    pub fn mds_form(opcode: u32) -> (u8, u8, u8, u8, bool) {
        let rs = ((opcode >> 21) & 0x1F) as u8;
        let ra = ((opcode >> 16) & 0x1F) as u8;
        let rb = ((opcode >> 11) & 0x1F) as u8;
        let mb = (((opcode >> 6) & 0x1F) | (opcode & 0x20)) as u8;
        let rc = (opcode & 1) != 0;
        (rs, ra, rb, mb, rc)
    }

    /// SPR number from its split encoding
    #[inline]
    pub fn spr_number(opcode: u32) -> u16 {
        let spr = ((opcode >> 11) & 0x3FF) as u16;
        ((spr & 0x1F) << 5) | (spr >> 5)
    }

    /// A-form: frt, fra, frb, frc, rc
    #[inline]
    pub fn a_form(opcode: u32) -> (u8, u8, u8, u8, bool) {
        let frt = ((opcode >> 21) & 0x1F) as u8;
        let fra = ((opcode >> 16) & 0x1F) as u8;
        let frb = ((opcode >> 11) & 0x1F) as u8;
        let frc = ((opcode >> 6) & 0x1F) as u8;
        let rc = (opcode & 1) != 0;
        (frt, fra, frb, frc, rc)
    }

    /// VA-form: vt, va, vb, vc
    #[inline]
    pub fn va_form(opcode: u32) -> (u8, u8, u8, u8) {
        let vt = ((opcode >> 21) & 0x1F) as u8;
        let va = ((opcode >> 16) & 0x1F) as u8;
        let vb = ((opcode >> 11) & 0x1F) as u8;
        let vc = ((opcode >> 6) & 0x1F) as u8;
        (vt, va, vb, vc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_addi() {
        // addi r3, r0, 100
        let decoded = PpcDecoder::decode(0x3860_0064);
        assert_eq!(decoded.op, 14);
        assert_eq!(decoded.form, InstructionForm::D);
        let (rt, ra, d) = PpcDecoder::d_form(0x3860_0064);
        assert_eq!((rt, ra, d), (3, 0, 100));
    }

    #[test]
    fn test_decode_add_is_xo() {
        // add r5, r3, r4 = 31 | rt=5 ra=3 rb=4 xo=266
        let opcode = (31 << 26) | (5 << 21) | (3 << 16) | (4 << 11) | (266 << 1);
        let decoded = PpcDecoder::decode(opcode);
        assert_eq!(decoded.form, InstructionForm::XO);
        assert_eq!(decoded.xo, 266);
    }

    #[test]
    fn test_decode_mfspr_is_xfx() {
        // mfspr r1, LR: spr field encodes 8 as (8 & 0x1f)<<5 | (8>>5)
        let spr_field = ((8 & 0x1F) << 16) | ((8 >> 5) << 11);
        let opcode = (31 << 26) | (1 << 21) | spr_field | (339 << 1);
        let decoded = PpcDecoder::decode(opcode);
        assert_eq!(decoded.form, InstructionForm::XFX);
        assert_eq!(PpcDecoder::spr_number(opcode), 8);
    }

    #[test]
    fn test_i_form_branch_sign_extension() {
        // b .-8
        let li = -8i32;
        let opcode = (18 << 26) | (((li as u32) & 0x03FF_FFFF) >> 2 << 2);
        let (decoded_li, aa, lk) = PpcDecoder::i_form(opcode);
        assert_eq!(decoded_li, -8);
        assert!(!aa);
        assert!(!lk);
    }

    #[test]
    fn test_md_form_split_fields() {
        // rldicl ra, rs, sh=34, mb=30: sh[5] lives in bit 1, mb[5] in bit 5
        let sh = 34u32;
        let mb = 30u32;
        let opcode = (30 << 26)
            | ((sh & 0x1F) << 11)
            | ((sh >> 5) << 1)
            | ((mb & 0x1F) << 6)
            | ((mb >> 5) << 5);
        let (_, _, dsh, dmb, _) = PpcDecoder::md_form(opcode);
        assert_eq!(dsh, 34);
        assert_eq!(dmb, 30);
    }

    #[test]
    fn test_decode_rlwinm() {
        // rlwinm r3, r4, 4, 28, 31
        let opcode = (21 << 26) | (4 << 21) | (3 << 16) | (4 << 11) | (28 << 6) | (31 << 1);
        let decoded = PpcDecoder::decode(opcode);
        assert_eq!(decoded.form, InstructionForm::M);
        let (rs, ra, sh, mb, me, rc) = PpcDecoder::m_form(opcode);
        assert_eq!((rs, ra, sh, mb, me, rc), (4, 3, 4, 28, 31, false));
    }
}
