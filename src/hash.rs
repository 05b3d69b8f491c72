//! Hash computation for cross-chain operation identifiers
//!
//! Both legs of a settlement derive the same operation id independently, so
//! the derivation must be deterministic over the trade id and the two local
//! account identifiers with no shared sequence source.

use tiny_keccak::{Hasher, Keccak};

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Derive the operation id for a settlement-like instruction.
///
/// keccak256 over the length-prefixed concatenation of trade id and the two
/// local account identifiers. Length prefixes prevent ambiguous
/// concatenations ("ab"+"c" vs "a"+"bc") from colliding.
pub fn derive_operation_id(trade_id: &str, from_account: &str, to_account: &str) -> String {
    let mut data = Vec::with_capacity(trade_id.len() + from_account.len() + to_account.len() + 12);
    for part in [trade_id, from_account, to_account] {
        data.extend_from_slice(&(part.len() as u32).to_be_bytes());
        data.extend_from_slice(part.as_bytes());
    }
    bytes32_to_hex(&keccak256(&data))
}

/// Compute an event signature hash from its canonical declaration, e.g.
/// `"HoldExecuted(bytes32,uint256)"`.
pub fn event_signature_hash(signature: &str) -> [u8; 32] {
    keccak256(signature.as_bytes())
}

/// Encode a text account/address identifier to 32 bytes (left-padded)
pub fn encode_account(account: &str) -> [u8; 32] {
    let mut result = [0u8; 32];
    let bytes = account.as_bytes();

    if bytes.len() <= 32 {
        let start = 32 - bytes.len();
        result[start..].copy_from_slice(bytes);
    } else {
        result.copy_from_slice(&keccak256(bytes));
    }

    result
}

/// Encode an EVM address (0x-prefixed hex) to 32 bytes (left-padded)
pub fn encode_evm_address(addr: &str) -> Result<[u8; 32], &'static str> {
    let hex_str = addr.strip_prefix("0x").unwrap_or(addr);

    if hex_str.len() != 40 {
        return Err("Invalid EVM address length");
    }

    let mut result = [0u8; 32];

    for i in 0..20 {
        result[12 + i] = u8::from_str_radix(&hex_str[i * 2..i * 2 + 2], 16)
            .map_err(|_| "Invalid hex character")?;
    }

    Ok(result)
}

/// Convert bytes to hex string with 0x prefix
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak256() {
        let result = keccak256(b"hello");
        assert_eq!(
            bytes32_to_hex(&result),
            "0x1c8aff950685c2ed4bc3174f3472287b56d9517b9c948127319a09a7a36deac8"
        );
    }

    #[test]
    fn test_operation_id_deterministic() {
        let a = derive_operation_id("O-101", "Bob", "Alice");
        let b = derive_operation_id("O-101", "Bob", "Alice");
        assert_eq!(a, b);
        assert!(a.starts_with("0x"));
        assert_eq!(a.len(), 66);
    }

    #[test]
    fn test_operation_id_sensitive_to_inputs() {
        let base = derive_operation_id("O-101", "Bob", "Alice");
        assert_ne!(base, derive_operation_id("O-102", "Bob", "Alice"));
        assert_ne!(base, derive_operation_id("O-101", "Alice", "Bob"));
    }

    #[test]
    fn test_operation_id_no_concat_ambiguity() {
        assert_ne!(
            derive_operation_id("ab", "c", "d"),
            derive_operation_id("a", "bc", "d")
        );
    }

    #[test]
    fn test_encode_account_left_pads() {
        let encoded = encode_account("Bob");
        assert_eq!(&encoded[29..], b"Bob");
        assert!(encoded[..29].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_encode_evm_address() {
        let addr = encode_evm_address("0xdead000000000000000000000000000000000000").unwrap();
        assert_eq!(addr[12], 0xde);
        assert_eq!(addr[13], 0xad);
        assert!(encode_evm_address("0x123").is_err());
    }
}
