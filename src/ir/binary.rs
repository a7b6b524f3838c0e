//! Module binary container
//!
//! ```text
//! offset 0   magic     "DGPUMOD\0"
//! offset 8   version   u32 little-endian
//! offset 12  length    u64 little-endian, payload bytes
//! offset 20  payload   JSON-encoded GpuModule
//! ```

use super::GpuModule;
use super::verify;
use crate::error::{Result, RuntimeError};

pub const MAGIC: &[u8; 8] = b"DGPUMOD\0";
pub const VERSION: u32 = 1;
pub const HEADER_LEN: usize = 20;

/// Serialize a module into a loadable binary
pub fn encode(module: &GpuModule) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(module)
        .map_err(|e| RuntimeError::malformed(format!("cannot serialize module: {}", e)))?;

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Parse and verify a module binary
pub fn decode(bytes: &[u8]) -> Result<GpuModule> {
    if bytes.len() < HEADER_LEN {
        return Err(RuntimeError::malformed(format!(
            "binary is {} bytes, shorter than the {}-byte header",
            bytes.len(),
            HEADER_LEN
        )));
    }

    let (header, payload) = bytes.split_at(HEADER_LEN);
    if &header[0..8] != MAGIC {
        return Err(RuntimeError::malformed("bad magic"));
    }

    let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
    if version != VERSION {
        return Err(RuntimeError::malformed(format!(
            "unsupported container version {}",
            version
        )));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&header[12..20]);
    let declared = u64::from_le_bytes(len_bytes);
    if declared != payload.len() as u64 {
        return Err(RuntimeError::malformed(format!(
            "payload length {} does not match header ({})",
            payload.len(),
            declared
        )));
    }

    let module: GpuModule = serde_json::from_slice(payload)
        .map_err(|e| RuntimeError::malformed(format!("invalid payload: {}", e)))?;
    verify::verify_module(&module)?;

    tracing::debug!(
        module = %module.name,
        kernels = module.kernels.len(),
        "decoded module binary"
    );
    Ok(module)
}

impl GpuModule {
    /// Serialize into the binary container
    pub fn to_binary(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    /// Parse and verify a binary container
    pub fn from_binary(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{GpuKernel, GpuBlock, BlockId, GpuTerminator};

    fn tiny_module() -> GpuModule {
        let mut kernel = GpuKernel::new("noop");
        let mut block = GpuBlock::new(BlockId(0), "entry");
        block.set_terminator(GpuTerminator::ReturnVoid);
        kernel.add_block(block);
        let mut module = GpuModule::new("tiny");
        module.add_kernel(kernel);
        module
    }

    #[test]
    fn test_header_layout() {
        let bytes = encode(&tiny_module()).unwrap();
        assert_eq!(&bytes[0..8], MAGIC);
        assert_eq!(&bytes[8..12], &1u32.to_le_bytes());
        let len = u64::from_le_bytes(bytes[12..20].try_into().unwrap());
        assert_eq!(len as usize, bytes.len() - HEADER_LEN);
    }

    #[test]
    fn test_decode_encoded() {
        let module = tiny_module();
        let decoded = decode(&encode(&module).unwrap()).unwrap();
        assert_eq!(decoded, module);
    }

    #[test]
    fn test_reject_short() {
        assert!(matches!(
            decode(b"DGPU"),
            Err(RuntimeError::MalformedModule { .. })
        ));
    }

    #[test]
    fn test_reject_bad_magic() {
        let mut bytes = encode(&tiny_module()).unwrap();
        bytes[0] = b'X';
        assert_eq!(decode(&bytes), Err(RuntimeError::malformed("bad magic")));
    }

    #[test]
    fn test_reject_version_and_length() {
        let mut bytes = encode(&tiny_module()).unwrap();
        bytes[8] = 9;
        assert!(decode(&bytes).is_err());

        let mut bytes = encode(&tiny_module()).unwrap();
        bytes.push(b' ');
        assert!(decode(&bytes).is_err());
    }
}
