use gimli::{EndianSlice, LittleEndian, Reader};

/// Maximum number of evaluation steps per expression byte.
const EXECUTION_LIMIT_FACTOR: usize = 10;

/// A DWARF location expression, as found in `DW_AT_location`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationExpr(Vec<u8>);

/// Register-derived inputs of a location expression evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocationContext {
    /// Value of `DW_AT_frame_base` for the frame owning the variable.
    pub frame_base: Option<u64>,

    /// Canonical frame address of the frame owning the variable.
    pub cfa: Option<u64>,

    /// Offset added to absolute addresses (load bias of the binary).
    pub static_base: u64,
}

impl LocationExpr {
    /// Wraps raw expression bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw expression bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Evaluates the expression and returns the computed address.
    ///
    /// Only the subset of opcodes emitted for unoptimized code is understood;
    /// any other opcode fails the evaluation.
    pub fn evaluate(&self, cx: &LocationContext) -> crate::Result<u64> {
        let mut reader = EndianSlice::new(&self.0, LittleEndian);
        let mut stack: Vec<i64> = Vec::with_capacity(3);

        let limit = self.0.len() * EXECUTION_LIMIT_FACTOR;

        for _ in 0..limit {
            if reader.is_empty() {
                break;
            }

            let op = gimli::DwOp(reader.read_u8()?);

            match op {
                gimli::DW_OP_nop => (),
                gimli::DW_OP_addr => {
                    let addr = reader.read_u64()?;
                    stack.push(addr.wrapping_add(cx.static_base) as i64);
                }
                gimli::DW_OP_fbreg => {
                    let offset = reader.read_sleb128()?;
                    let base = cx.frame_base.ok_or(crate::Error::MissingFrameBase)?;
                    stack.push((base as i64).wrapping_add(offset));
                }
                gimli::DW_OP_call_frame_cfa => {
                    let cfa = cx.cfa.ok_or(crate::Error::MissingCfa)?;
                    stack.push(cfa as i64);
                }
                gimli::DW_OP_const1u => stack.push(reader.read_u8()? as i64),
                gimli::DW_OP_const1s => stack.push(reader.read_i8()? as i64),
                gimli::DW_OP_const2u => stack.push(reader.read_u16()? as i64),
                gimli::DW_OP_const2s => stack.push(reader.read_i16()? as i64),
                gimli::DW_OP_const4u => stack.push(reader.read_u32()? as i64),
                gimli::DW_OP_const4s => stack.push(reader.read_i32()? as i64),
                gimli::DW_OP_const8u => stack.push(reader.read_u64()? as i64),
                gimli::DW_OP_const8s => stack.push(reader.read_i64()?),
                gimli::DW_OP_constu => stack.push(reader.read_uleb128()? as i64),
                gimli::DW_OP_consts => stack.push(reader.read_sleb128()?),
                gimli::DW_OP_plus_uconst => {
                    let addend = reader.read_uleb128()?;
                    let top = stack.pop().ok_or(crate::Error::EmptyLocationStack)?;
                    stack.push(top.wrapping_add(addend as i64));
                }
                op if (gimli::DW_OP_lit0.0..=gimli::DW_OP_lit31.0).contains(&op.0) => {
                    stack.push(i64::from(op.0 - gimli::DW_OP_lit0.0));
                }
                op => return Err(crate::Error::UnsupportedOpcode(op.0)),
            }
        }

        stack
            .last()
            .map(|&v| v as u64)
            .ok_or(crate::Error::EmptyLocationStack)
    }
}

#[cfg(test)]
mod tests {
    use super::{LocationContext, LocationExpr};

    fn frame(base: u64) -> LocationContext {
        LocationContext {
            frame_base: Some(base),
            cfa: Some(base),
            static_base: 0,
        }
    }

    #[test]
    fn fbreg_negative_offset() {
        // DW_OP_fbreg -20
        let expr = LocationExpr::new([0x91, 0x6c]);
        let addr = expr.evaluate(&frame(0x7ffc_0000_1000)).expect("evaluate");
        assert_eq!(addr, 0x7ffc_0000_1000 - 20);
    }

    #[test]
    fn addr_is_relocated_by_static_base() {
        let mut bytes = vec![0x03];
        bytes.extend_from_slice(&0x4010u64.to_le_bytes());

        let cx = LocationContext {
            static_base: 0x5555_5555_4000,
            ..Default::default()
        };

        let addr = LocationExpr::new(bytes).evaluate(&cx).expect("evaluate");
        assert_eq!(addr, 0x5555_5555_8010);
    }

    #[test]
    fn call_frame_cfa_and_nop() {
        let expr = LocationExpr::new([0x96, 0x9c, 0x96]);
        assert_eq!(expr.evaluate(&frame(0x1000)).expect("evaluate"), 0x1000);
    }

    #[test]
    fn literal_and_plus_uconst() {
        // DW_OP_lit4, DW_OP_plus_uconst 8
        let expr = LocationExpr::new([0x34, 0x23, 0x08]);
        assert_eq!(expr.evaluate(&LocationContext::default()).expect("evaluate"), 12);
    }

    #[test]
    fn unknown_opcode_fails() {
        // DW_OP_breg6 is not evaluated
        let expr = LocationExpr::new([0x76, 0x10]);
        assert!(matches!(
            expr.evaluate(&frame(0x1000)),
            Err(crate::Error::UnsupportedOpcode(0x76))
        ));
    }

    #[test]
    fn empty_expression_fails() {
        let expr = LocationExpr::new([]);
        assert!(matches!(
            expr.evaluate(&frame(0x1000)),
            Err(crate::Error::EmptyLocationStack)
        ));
    }

    #[test]
    fn fbreg_without_frame_fails() {
        let expr = LocationExpr::new([0x91, 0x10]);
        assert!(matches!(
            expr.evaluate(&LocationContext::default()),
            Err(crate::Error::MissingFrameBase)
        ));
    }
}
