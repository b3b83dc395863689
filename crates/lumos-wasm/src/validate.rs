//! Pre-compilation validation of WASM binaries.
//!
//! Before a module ever reaches the engine, its memory section (section id
//! 5) is parsed directly from the binary. Every memory must declare a
//! maximum, and that maximum must not exceed the per-launch page limit.
//! A module that could grow without bound is rejected outright.

use crate::WasmError;

const MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];
const VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];
const MEMORY_SECTION: u8 = 5;

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, WasmError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| WasmError::Validation("truncated binary".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn leb_u32(&mut self) -> Result<u32, WasmError> {
        let mut result: u32 = 0;
        let mut shift = 0;
        loop {
            let byte = self.u8()?;
            result |= u32::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift >= 35 {
                return Err(WasmError::Validation("LEB128 overflow".into()));
            }
        }
    }

    fn skip(&mut self, n: usize) -> Result<(), WasmError> {
        if self.pos + n > self.bytes.len() {
            return Err(WasmError::Validation("truncated section".into()));
        }
        self.pos += n;
        Ok(())
    }

    fn done(&self) -> bool {
        self.pos >= self.bytes.len()
    }
}

/// Verify every memory in the binary's memory section declares a bounded
/// maximum not exceeding `max_pages`.
///
/// A module with no memory section trivially passes.
pub fn validate_memory(bytes: &[u8], max_pages: u32) -> Result<(), WasmError> {
    if bytes.len() < 8 || bytes[0..4] != MAGIC || bytes[4..8] != VERSION {
        return Err(WasmError::Validation("not a wasm binary".into()));
    }

    let mut reader = Reader::new(&bytes[8..]);
    while !reader.done() {
        let id = reader.u8()?;
        let size = reader.leb_u32()? as usize;
        if id != MEMORY_SECTION {
            reader.skip(size)?;
            continue;
        }

        let count = reader.leb_u32()?;
        for _ in 0..count {
            let flags = reader.u8()?;
            let _min = reader.leb_u32()?;
            // Bit 0 of the limits flag marks a present maximum.
            if flags & 0x01 == 0 {
                return Err(WasmError::UnboundedMemory);
            }
            let max = reader.leb_u32()?;
            if max > max_pages {
                return Err(WasmError::MemoryTooLarge { declared: max, limit: max_pages });
            }
        }
        return Ok(());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-build a binary with one memory of the given limits.
    fn module_with_memory(min: u8, max: Option<u8>) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&VERSION);
        let mut section = vec![1u8]; // one memory
        match max {
            Some(max) => {
                section.push(0x01);
                section.push(min);
                section.push(max);
            }
            None => {
                section.push(0x00);
                section.push(min);
            }
        }
        bytes.push(MEMORY_SECTION);
        bytes.push(section.len() as u8);
        bytes.extend_from_slice(&section);
        bytes
    }

    #[test]
    fn bounded_memory_within_limit_passes() {
        let bytes = module_with_memory(1, Some(16));
        assert!(validate_memory(&bytes, 1024).is_ok());
    }

    #[test]
    fn unbounded_memory_is_rejected() {
        let bytes = module_with_memory(1, None);
        assert!(matches!(
            validate_memory(&bytes, 1024),
            Err(WasmError::UnboundedMemory)
        ));
    }

    #[test]
    fn oversized_maximum_is_rejected() {
        let bytes = module_with_memory(1, Some(64));
        assert!(matches!(
            validate_memory(&bytes, 32),
            Err(WasmError::MemoryTooLarge { declared: 64, limit: 32 })
        ));
    }

    #[test]
    fn module_without_memory_passes() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&VERSION);
        assert!(validate_memory(&bytes, 1024).is_ok());
    }

    #[test]
    fn garbage_is_not_a_wasm_binary() {
        assert!(matches!(
            validate_memory(b"hello", 1024),
            Err(WasmError::Validation(_))
        ));
    }

    #[test]
    fn wat_produced_binaries_validate() {
        let bytes = wat::parse_str("(module (memory 1 16))").unwrap();
        assert!(validate_memory(&bytes, 1024).is_ok());

        let unbounded = wat::parse_str("(module (memory 1))").unwrap();
        assert!(matches!(
            validate_memory(&unbounded, 1024),
            Err(WasmError::UnboundedMemory)
        ));
    }
}
