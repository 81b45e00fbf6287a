//! Operators
//!
//! Operators transform a block payload before it is buffered. The operator
//! chain of a block is persisted by name in its record, so a reader can
//! undo it without out-of-band knowledge. Names are resolved through an
//! explicit [`OperatorRegistry`] owned by the [`Adios`](crate::Adios)
//! context.

use std::sync::Arc;

use bpio_core::DataType;
use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Separator between operator names of a chain in block records
pub const CHAIN_SEPARATOR: char = '+';

/// What an operator knows about the block it transforms
#[derive(Debug, Clone, Copy)]
pub struct BlockInfo<'a> {
    pub data_type: DataType,
    pub count: &'a [u64],
    pub params: &'a HashMap<String, String>,
}

/// Payload transform identified by name
pub trait Operator: Send + Sync {
    fn name(&self) -> &str;

    fn compress(&self, data: &[u8], info: &BlockInfo<'_>) -> Result<Vec<u8>>;

    /// Undo [`Operator::compress`]; `expected_len` is the original length
    /// for the last operator of a chain and a capacity hint otherwise
    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>>;
}

fn op_error(name: &str, message: impl Into<String>) -> Error {
    Error::Operator {
        name: name.to_string(),
        message: message.into(),
    }
}

/// Byte shuffle grouping the i-th byte of every element together
///
/// The element size is stored in the first output byte.
#[derive(Debug, Default)]
pub struct ShuffleOperator;

impl Operator for ShuffleOperator {
    fn name(&self) -> &str {
        "shuffle"
    }

    fn compress(&self, data: &[u8], info: &BlockInfo<'_>) -> Result<Vec<u8>> {
        let elem = info.data_type.size_bytes().max(1);
        if elem > u8::MAX as usize {
            return Err(op_error(self.name(), "element too wide"));
        }
        let n = data.len() / elem;
        let mut out = Vec::with_capacity(data.len() + 1);
        out.push(elem as u8);
        for byte in 0..elem {
            out.extend((0..n).map(|i| data[i * elem + byte]));
        }
        out.extend_from_slice(&data[n * elem..]);
        Ok(out)
    }

    fn decompress(&self, data: &[u8], _expected_len: usize) -> Result<Vec<u8>> {
        let (&elem, body) = data
            .split_first()
            .ok_or_else(|| op_error(self.name(), "empty input"))?;
        let elem = elem.max(1) as usize;
        let n = body.len() / elem;
        let mut out = vec![0u8; body.len()];
        for byte in 0..elem {
            for i in 0..n {
                out[i * elem + byte] = body[byte * n + i];
            }
        }
        out[n * elem..].copy_from_slice(&body[n * elem..]);
        Ok(out)
    }
}

/// bzip2 compression; parameter `blocksize100k` selects the level (1-9)
#[cfg(feature = "bzip2")]
#[derive(Debug, Default)]
pub struct Bzip2Operator;

#[cfg(feature = "bzip2")]
impl Operator for Bzip2Operator {
    fn name(&self) -> &str {
        "bzip2"
    }

    fn compress(&self, data: &[u8], info: &BlockInfo<'_>) -> Result<Vec<u8>> {
        use std::io::Write;

        let level = match info.params.get("blocksize100k") {
            Some(v) => v
                .parse::<u32>()
                .ok()
                .filter(|l| (1..=9).contains(l))
                .ok_or_else(|| op_error(self.name(), format!("invalid blockSize100k '{v}'")))?,
            None => 9,
        };
        let mut encoder =
            bzip2::write::BzEncoder::new(Vec::with_capacity(data.len() / 2), bzip2::Compression::new(level));
        encoder
            .write_all(data)
            .map_err(|e| op_error(self.name(), e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| op_error(self.name(), e.to_string()))
    }

    fn decompress(&self, data: &[u8], expected_len: usize) -> Result<Vec<u8>> {
        use std::io::Read;

        let mut out = Vec::with_capacity(expected_len);
        bzip2::read::BzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| op_error(self.name(), e.to_string()))?;
        Ok(out)
    }
}

/// Name-to-operator table
#[derive(Default)]
pub struct OperatorRegistry {
    operators: RwLock<HashMap<String, Arc<dyn Operator>>>,
}

impl std::fmt::Debug for OperatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.operators.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("OperatorRegistry").field("operators", &names).finish()
    }
}

impl OperatorRegistry {
    /// Registry with the shipped operators
    pub fn with_defaults() -> Self {
        let registry = Self::default();
        registry.register(Arc::new(ShuffleOperator));
        #[cfg(feature = "bzip2")]
        registry.register(Arc::new(Bzip2Operator));
        registry
    }

    /// Add or replace an operator under its name
    pub fn register(&self, operator: Arc<dyn Operator>) {
        let name = operator.name().to_ascii_lowercase();
        self.operators.write().insert(name, operator);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Operator>> {
        self.operators
            .read()
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("operator '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operators.read().contains_key(&name.to_ascii_lowercase())
    }

    /// Undo a persisted chain such as `shuffle+bzip2`
    pub fn decode_chain(&self, chain: &str, data: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        let names: Vec<&str> = chain.split(CHAIN_SEPARATOR).collect();
        let mut current = data.to_vec();
        for (i, name) in names.iter().enumerate().rev() {
            let hint = if i == 0 { raw_len } else { current.len() };
            current = self.get(name)?.decompress(&current, hint)?;
        }
        if current.len() != raw_len {
            return Err(op_error(
                chain,
                format!("decoded {} bytes, expected {raw_len}", current.len()),
            ));
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info<'a>(count: &'a [u64], params: &'a HashMap<String, String>) -> BlockInfo<'a> {
        BlockInfo {
            data_type: DataType::F64,
            count,
            params,
        }
    }

    #[test]
    fn test_shuffle_layout() {
        let params = HashMap::new();
        let data: Vec<u8> = 1.0f64
            .to_ne_bytes()
            .iter()
            .chain(2.0f64.to_ne_bytes().iter())
            .copied()
            .collect();
        let shuffled = ShuffleOperator.compress(&data, &info(&[2], &params)).unwrap();
        assert_eq!(shuffled[0], 8);
        assert_eq!(shuffled[1], data[0]);
        assert_eq!(shuffled[2], data[8]);
        assert_eq!(ShuffleOperator.decompress(&shuffled, 16).unwrap(), data);
    }

    #[cfg(feature = "bzip2")]
    #[test]
    fn test_chain_decodes_in_reverse() {
        let registry = OperatorRegistry::with_defaults();
        let params = HashMap::new();
        let data: Vec<u8> = (0..4096u32).flat_map(|v| (v % 17).to_ne_bytes()).collect();
        let meta = info(&[512], &params);

        let shuffled = registry.get("shuffle").unwrap().compress(&data, &meta).unwrap();
        let packed = registry.get("BZIP2").unwrap().compress(&shuffled, &meta).unwrap();
        assert!(packed.len() < data.len());

        let restored = registry.decode_chain("shuffle+bzip2", &packed, data.len()).unwrap();
        assert_eq!(restored, data);
        assert!(registry.decode_chain("bzip2", &packed, 3).is_err());
    }

    #[test]
    fn test_unknown_operator() {
        let registry = OperatorRegistry::with_defaults();
        assert!(matches!(registry.get("zfp"), Err(Error::NotFound(_))));
        assert!(registry.contains("Shuffle"));
    }
}
