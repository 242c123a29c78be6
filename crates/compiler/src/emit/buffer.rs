//! Code buffer, labels and fixups
//!
//! Creating a label before its definition writes a placeholder and records
//! a fixup; defining a label records the current offset; the resolver pass
//! rewrites each placeholder with the computed displacement once every
//! function is in the buffer.

/// A position in the byte stream, possibly not yet defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(pub u32);

/// How a fixup patches its site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    /// 4-byte little-endian displacement relative to the end of the field
    /// (x86-64 `rel32` for jmp/jcc/call).
    Rel32,
    /// RISC-V B-type: 13-bit signed offset re-encoded into the
    /// instruction word at the site.
    Rv64Branch,
    /// RISC-V J-type: 21-bit signed offset re-encoded.
    Rv64Jal,
}

#[derive(Debug, Clone, Copy)]
pub struct Fixup {
    /// Offset of the placeholder (field for Rel32, instruction word for
    /// the RISC-V kinds).
    pub at: usize,
    pub label: u32,
    pub kind: FixupKind,
}

#[derive(Debug, Default)]
pub struct Buffer {
    pub bytes: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn emit_u8(&mut self, b: u8) {
        self.bytes.push(b);
    }

    pub fn emit_u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn emit_u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn emit_u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    pub fn patch_u32(&mut self, at: usize, v: u32) {
        self.bytes[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    pub fn read_u32(&self, at: usize) -> u32 {
        u32::from_le_bytes(self.bytes[at..at + 4].try_into().expect("4 bytes"))
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label((self.labels.len() - 1) as u32)
    }

    /// Define a label at the current offset.
    pub fn bind_label(&mut self, label: Label) {
        debug_assert!(
            self.labels[label.0 as usize].is_none(),
            "label {} bound twice",
            label.0
        );
        self.labels[label.0 as usize] = Some(self.bytes.len());
    }

    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels[label.0 as usize]
    }

    /// Record a fixup for the placeholder just written (or the instruction
    /// word at `at` for the RISC-V kinds).
    pub fn record_fixup(&mut self, at: usize, label: Label, kind: FixupKind) {
        self.fixups.push(Fixup {
            at,
            label: label.0,
            kind,
        });
    }

    /// Patch every recorded fixup. Call once, after all functions are in
    /// the buffer.
    pub fn resolve_fixups(&mut self) -> Result<(), String> {
        let fixups = std::mem::take(&mut self.fixups);
        for fixup in &fixups {
            let target = self.labels[fixup.label as usize]
                .ok_or_else(|| format!("unresolved label {}", fixup.label))?;
            match fixup.kind {
                FixupKind::Rel32 => {
                    let disp = target as i64 - (fixup.at as i64 + 4);
                    if disp < i32::MIN as i64 || disp > i32::MAX as i64 {
                        return Err(format!("rel32 displacement out of range: {}", disp));
                    }
                    self.patch_u32(fixup.at, disp as u32);
                }
                FixupKind::Rv64Branch => {
                    let disp = target as i64 - fixup.at as i64;
                    if !(-4096..=4094).contains(&disp) || disp % 2 != 0 {
                        return Err(format!("B-type displacement out of range: {}", disp));
                    }
                    let word = self.read_u32(fixup.at);
                    self.patch_u32(fixup.at, encode_b_imm(word, disp as i32));
                }
                FixupKind::Rv64Jal => {
                    let disp = target as i64 - fixup.at as i64;
                    if !(-(1 << 20)..(1 << 20)).contains(&disp) || disp % 2 != 0 {
                        return Err(format!("J-type displacement out of range: {}", disp));
                    }
                    let word = self.read_u32(fixup.at);
                    self.patch_u32(fixup.at, encode_j_imm(word, disp as i32));
                }
            }
        }
        Ok(())
    }
}

/// Splice a 13-bit signed branch offset into a B-type instruction word.
pub fn encode_b_imm(word: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    let cleared = word & 0x01FF_F07F;
    cleared
        | (((imm >> 12) & 1) << 31)
        | (((imm >> 5) & 0x3F) << 25)
        | (((imm >> 1) & 0xF) << 8)
        | (((imm >> 11) & 1) << 7)
}

/// Splice a 21-bit signed jump offset into a J-type instruction word.
pub fn encode_j_imm(word: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    let cleared = word & 0x0000_0FFF;
    cleared
        | (((imm >> 20) & 1) << 31)
        | (((imm >> 1) & 0x3FF) << 21)
        | (((imm >> 11) & 1) << 20)
        | (((imm >> 12) & 0xFF) << 12)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_little_endian() {
        let mut b = Buffer::new();
        b.emit_u32(0x0123_4567);
        assert_eq!(b.bytes, vec![0x67, 0x45, 0x23, 0x01]);
    }

    #[test]
    fn forward_rel32_fixup() {
        let mut b = Buffer::new();
        let l = b.new_label();
        // jmp rel32 with a zero placeholder
        b.emit_u8(0xE9);
        let at = b.len();
        b.emit_u32(0);
        b.record_fixup(at, l, FixupKind::Rel32);
        // padding, then the target
        b.emit_u8(0x90);
        b.emit_u8(0x90);
        b.bind_label(l);
        b.resolve_fixups().unwrap();
        // target - (at + 4) = 7 - 5 = 2
        assert_eq!(b.read_u32(at), 2);
    }

    #[test]
    fn backward_rel32_fixup() {
        let mut b = Buffer::new();
        let l = b.new_label();
        b.bind_label(l);
        b.emit_u8(0x90);
        b.emit_u8(0xE9);
        let at = b.len();
        b.emit_u32(0);
        b.record_fixup(at, l, FixupKind::Rel32);
        b.resolve_fixups().unwrap();
        // 0 - (2 + 4) = -6
        assert_eq!(b.read_u32(at) as i32, -6);
    }

    #[test]
    fn unresolved_label_is_an_error() {
        let mut b = Buffer::new();
        let l = b.new_label();
        let at = b.len();
        b.emit_u32(0);
        b.record_fixup(at, l, FixupKind::Rel32);
        assert!(b.resolve_fixups().is_err());
    }

    #[test]
    fn b_type_encoding_round_trip() {
        // beq x1, x2, +8: opcode 0x63, funct3 0, rs1=1, rs2=2
        let base = 0x63 | (0 << 12) | (1 << 15) | (2 << 20);
        let word = encode_b_imm(base, 8);
        // imm[4:1] = 0b0100 in bits 11:8
        assert_eq!((word >> 8) & 0xF, 0b0100);
        assert_eq!(word >> 31, 0); // positive
        let neg = encode_b_imm(base, -8);
        assert_eq!(neg >> 31, 1); // sign bit set
    }

    #[test]
    fn j_type_encoding_sign() {
        let base = 0x6F | (1 << 7); // jal ra, ...
        let pos = encode_j_imm(base, 2048);
        // imm[11] lands in bit 20
        assert_eq!((pos >> 20) & 1, 1);
        let neg = encode_j_imm(base, -4);
        assert_eq!(neg >> 31, 1);
    }

    #[test]
    fn branch_range_is_enforced() {
        let mut b = Buffer::new();
        let l = b.new_label();
        b.bind_label(l);
        for _ in 0..5000 {
            b.emit_u8(0);
        }
        let at = b.len();
        b.emit_u32(0x63);
        b.record_fixup(at, l, FixupKind::Rv64Branch);
        assert!(b.resolve_fixups().is_err());
    }
}
