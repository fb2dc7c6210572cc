//! Just enough of the Solidity ABI to talk to the store contract: selectors
//! derived from the manifest's interface descriptor, static argument encoding,
//! word-level return decoding and revert payload decoding.

use crate::types::Address;
use itertools::Itertools;
use serde::Deserialize;
use sha3::{
    Digest,
    Keccak256,
};
use thiserror::Error;

pub const WORD: usize = 32;

pub type Selector = [u8; 4];

/// `Error(string)`
pub const ERROR_STRING_SELECTOR: Selector = [0x08, 0xc3, 0x79, 0xa0];
/// `Panic(uint256)`
pub const PANIC_SELECTOR: Selector = [0x4e, 0x48, 0x7b, 0x71];

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AbiError {
    #[error("return data too short: needed {needed} bytes, got {actual}")]
    OutOfBounds { needed: usize, actual: usize },
    #[error("value does not fit in {bits} bits")]
    Overflow { bits: u32 },
    #[error("word is not a valid address")]
    InvalidAddress,
    #[error("word is not a valid bool")]
    InvalidBool,
    #[error("string is not valid utf-8")]
    InvalidString,
    #[error("function `{0}` is missing from the contract interface")]
    MissingFunction(String),
}

pub fn selector(signature: &str) -> Selector {
    let digest = Keccak256::digest(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// Static argument values; the store surface never passes dynamic types.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Token {
    Uint(u128),
    Address(Address),
}

impl Token {
    fn to_word(self) -> [u8; WORD] {
        let mut word = [0u8; WORD];
        match self {
            Token::Uint(value) => word[WORD - 16..].copy_from_slice(&value.to_be_bytes()),
            Token::Address(address) => word[WORD - 20..].copy_from_slice(address.as_bytes()),
        }
        word
    }
}

pub fn encode_call(selector: Selector, args: &[Token]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + args.len() * WORD);
    data.extend_from_slice(&selector);
    for arg in args {
        data.extend_from_slice(&arg.to_word());
    }
    data
}

/// Reads head words out of ABI-encoded return data.
#[derive(Clone, Copy, Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn word_at_offset(&self, offset: usize) -> Result<&'a [u8], AbiError> {
        let end = offset.checked_add(WORD).ok_or(AbiError::Overflow { bits: 64 })?;
        self.data.get(offset..end).ok_or(AbiError::OutOfBounds {
            needed: end,
            actual: self.data.len(),
        })
    }

    pub fn word(&self, index: usize) -> Result<&'a [u8], AbiError> {
        self.word_at_offset(index * WORD)
    }

    pub fn uint(&self, index: usize) -> Result<u128, AbiError> {
        word_to_u128(self.word(index)?)
    }

    pub fn u64(&self, index: usize) -> Result<u64, AbiError> {
        u64::try_from(self.uint(index)?).map_err(|_| AbiError::Overflow { bits: 64 })
    }

    pub fn address(&self, index: usize) -> Result<Address, AbiError> {
        word_to_address(self.word(index)?)
    }

    pub fn bool(&self, index: usize) -> Result<bool, AbiError> {
        match self.uint(index)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(AbiError::InvalidBool),
        }
    }

    fn offset(&self, index: usize) -> Result<usize, AbiError> {
        usize::try_from(self.uint(index)?).map_err(|_| AbiError::Overflow { bits: 64 })
    }

    /// Dynamic `address[]` whose head pointer sits in word `index`.
    pub fn address_array(&self, index: usize) -> Result<Vec<Address>, AbiError> {
        let start = self.offset(index)?;
        let len = word_to_u128(self.word_at_offset(start)?)?;
        let len = usize::try_from(len).map_err(|_| AbiError::Overflow { bits: 64 })?;
        (1..=len)
            .map(|i| {
                let at = WORD
                    .checked_mul(i)
                    .and_then(|rel| start.checked_add(rel))
                    .ok_or(AbiError::Overflow { bits: 64 })?;
                word_to_address(self.word_at_offset(at)?)
            })
            .collect()
    }

    /// Static `address[len]` laid out inline from word `index`.
    pub fn fixed_address_array(&self, index: usize, len: usize) -> Result<Vec<Address>, AbiError> {
        (index..index + len).map(|i| self.address(i)).collect()
    }

    /// Dynamic `string` whose head pointer sits in word `index`.
    pub fn string(&self, index: usize) -> Result<String, AbiError> {
        let start = self.offset(index)?;
        let len = word_to_u128(self.word_at_offset(start)?)?;
        let len = usize::try_from(len).map_err(|_| AbiError::Overflow { bits: 64 })?;
        let body_start = start + WORD;
        let body_end = body_start
            .checked_add(len)
            .ok_or(AbiError::Overflow { bits: 64 })?;
        let bytes = self
            .data
            .get(body_start..body_end)
            .ok_or(AbiError::OutOfBounds {
                needed: body_end,
                actual: self.data.len(),
            })?;
        String::from_utf8(bytes.to_vec()).map_err(|_| AbiError::InvalidString)
    }
}

fn word_to_u128(word: &[u8]) -> Result<u128, AbiError> {
    if word[..WORD - 16].iter().any(|b| *b != 0) {
        return Err(AbiError::Overflow { bits: 128 });
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[WORD - 16..]);
    Ok(u128::from_be_bytes(low))
}

fn word_to_address(word: &[u8]) -> Result<Address, AbiError> {
    if word[..WORD - 20].iter().any(|b| *b != 0) {
        return Err(AbiError::InvalidAddress);
    }
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&word[WORD - 20..]);
    Ok(Address::new(bytes))
}

/// Decodes a revert payload into a human readable reason. Returns `None` for
/// an empty payload.
pub fn decode_revert(data: &[u8]) -> Option<String> {
    if data.len() < 4 {
        return None;
    }
    let (head, body) = data.split_at(4);
    let decoder = Decoder::new(body);
    if head == ERROR_STRING_SELECTOR {
        return Some(
            decoder
                .string(0)
                .unwrap_or_else(|_| format!("malformed revert reason 0x{}", hex::encode(body))),
        );
    }
    if head == PANIC_SELECTOR {
        return Some(match decoder.uint(0) {
            Ok(code) => format!("panic 0x{code:02x} ({})", panic_description(code)),
            Err(_) => "panic with malformed code".to_string(),
        });
    }
    Some(format!("custom error 0x{}", hex::encode(head)))
}

fn panic_description(code: u128) -> &'static str {
    match code {
        0x01 => "assertion failed",
        0x11 => "arithmetic overflow or underflow",
        0x12 => "division by zero",
        0x21 => "invalid enum value",
        0x31 => "pop on empty array",
        0x32 => "array index out of bounds",
        0x41 => "out of memory",
        0x51 => "call to uninitialized function",
        _ => "unknown panic",
    }
}

/// One entry of a JSON interface descriptor.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AbiEntry {
    #[serde(rename = "type", default = "default_entry_type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub inputs: Vec<AbiParam>,
    #[serde(default)]
    pub outputs: Vec<AbiParam>,
    #[serde(rename = "stateMutability", default)]
    pub state_mutability: Option<String>,
    #[serde(default)]
    pub constant: Option<bool>,
    #[serde(default)]
    pub payable: Option<bool>,
}

fn default_entry_type() -> String {
    "function".to_string()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct AbiParam {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub components: Vec<AbiParam>,
}

impl AbiParam {
    /// Canonical type as used in a function signature, with tuples expanded.
    pub fn canonical_type(&self) -> String {
        match self.kind.strip_prefix("tuple") {
            Some(suffix) => format!(
                "({}){suffix}",
                self.components.iter().map(AbiParam::canonical_type).join(",")
            ),
            None => self.kind.clone(),
        }
    }

    fn flatten_into<'a>(&'a self, out: &mut Vec<&'a AbiParam>) {
        if self.kind == "tuple" {
            for component in &self.components {
                component.flatten_into(out);
            }
        } else {
            out.push(self);
        }
    }
}

/// A callable resolved from the interface descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct Function {
    pub name: String,
    pub signature: String,
    pub selector: Selector,
    pub outputs: Vec<AbiParam>,
    pub is_view: bool,
    pub is_payable: bool,
}

impl Function {
    pub fn from_entry(entry: &AbiEntry) -> Option<Self> {
        if entry.kind != "function" {
            return None;
        }
        let name = entry.name.clone()?;
        let signature = format!(
            "{name}({})",
            entry.inputs.iter().map(AbiParam::canonical_type).join(",")
        );
        let mutability = entry.state_mutability.as_deref();
        let is_view = matches!(mutability, Some("view") | Some("pure"))
            || (mutability.is_none() && entry.constant == Some(true));
        let is_payable =
            mutability == Some("payable") || (mutability.is_none() && entry.payable == Some(true));
        Some(Self {
            selector: selector(&signature),
            name,
            signature,
            outputs: entry.outputs.clone(),
            is_view,
            is_payable,
        })
    }

    pub fn encode(&self, args: &[Token]) -> Vec<u8> {
        encode_call(self.selector, args)
    }

    /// Head-word positions of the outputs, with static tuples flattened.
    pub fn flat_outputs(&self) -> Vec<&AbiParam> {
        let mut out = Vec::new();
        for param in &self.outputs {
            param.flatten_into(&mut out);
        }
        out
    }

    /// Word index of the named output, else of the first output whose type
    /// matches `fallback_kind`.
    pub fn output_word(&self, name: &str, fallback_kind: &str) -> Option<usize> {
        let flat = self.flat_outputs();
        flat.iter()
            .position(|p| p.name.trim_start_matches('_') == name)
            .or_else(|| flat.iter().position(|p| p.kind == fallback_kind))
    }
}

/// Length of a static array type such as `address[16]`; `None` for dynamic
/// arrays and non-array types.
pub fn fixed_array_len(kind: &str) -> Option<usize> {
    let inner = kind.strip_suffix(']')?;
    let (_, len) = inner.rsplit_once('[')?;
    len.parse().ok()
}

pub fn find_function(abi: &[AbiEntry], name: &str) -> Result<Function, AbiError> {
    abi.iter()
        .filter(|entry| entry.name.as_deref() == Some(name))
        .find_map(Function::from_entry)
        .ok_or_else(|| AbiError::MissingFunction(name.to_string()))
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;

    fn word_u(value: u128) -> Vec<u8> {
        Token::Uint(value).to_word().to_vec()
    }

    fn word_a(address: Address) -> Vec<u8> {
        Token::Address(address).to_word().to_vec()
    }

    fn revert_payload(reason: &str) -> Vec<u8> {
        let mut data = ERROR_STRING_SELECTOR.to_vec();
        data.extend(word_u(0x20));
        data.extend(word_u(reason.len() as u128));
        let mut body = reason.as_bytes().to_vec();
        body.resize(reason.len().div_ceil(WORD) * WORD, 0);
        data.extend(body);
        data
    }

    #[test]
    fn selector__matches_well_known_signatures() {
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
        assert_eq!(selector("balanceOf(address)"), [0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(selector("Error(string)"), ERROR_STRING_SELECTOR);
        assert_eq!(selector("Panic(uint256)"), PANIC_SELECTOR);
    }

    #[test]
    fn encode_call__pads_static_arguments() {
        // given
        let owner = Address::new([0x11; 20]);

        // when
        let data = encode_call([1, 2, 3, 4], &[Token::Uint(7), Token::Address(owner)]);

        // then
        assert_eq!(data.len(), 4 + 2 * WORD);
        assert_eq!(&data[..4], &[1, 2, 3, 4]);
        assert_eq!(data[4 + WORD - 1], 7);
        assert!(data[4..4 + WORD - 1].iter().all(|b| *b == 0));
        assert_eq!(&data[4 + WORD + 12..], owner.as_bytes());
    }

    #[test]
    fn decoder__reads_address_array() {
        // given
        let a = Address::new([0xaa; 20]);
        let data = [word_u(0x20), word_u(3), word_a(Address::ZERO), word_a(a), word_a(Address::ZERO)]
            .concat();

        // when
        let owners = Decoder::new(&data).address_array(0).unwrap();

        // then
        assert_eq!(owners, vec![Address::ZERO, a, Address::ZERO]);
    }

    #[test]
    fn decoder__reads_fixed_address_array_inline() {
        // given
        let a = Address::new([0xaa; 20]);
        let data = [word_a(a), word_a(Address::ZERO)].concat();

        // when
        let owners = Decoder::new(&data).fixed_address_array(0, 2).unwrap();

        // then
        assert_eq!(owners, vec![a, Address::ZERO]);
        assert_eq!(fixed_array_len("address[16]"), Some(16));
        assert_eq!(fixed_array_len("address[]"), None);
        assert_eq!(fixed_array_len("address"), None);
    }

    #[test]
    fn decoder__reports_truncated_data() {
        let data = [word_u(0x20), word_u(2), word_a(Address::ZERO)].concat();
        let err = Decoder::new(&data).address_array(0).unwrap_err();
        assert_eq!(
            err,
            AbiError::OutOfBounds {
                needed: 4 * WORD,
                actual: 3 * WORD
            }
        );
    }

    #[test]
    fn decoder__rejects_dirty_address_words() {
        let mut word = word_a(Address::new([0xaa; 20]));
        word[0] = 1;
        assert_eq!(Decoder::new(&word).address(0), Err(AbiError::InvalidAddress));
    }

    #[test]
    fn decoder__string_with_huge_length__is_an_error() {
        // given
        let data = [word_u(0x20), word_u(u128::from(u64::MAX))].concat();

        // when
        let err = Decoder::new(&data).string(0).unwrap_err();

        // then
        assert!(matches!(
            err,
            AbiError::Overflow { .. } | AbiError::OutOfBounds { .. }
        ));
    }

    #[test]
    fn decoder__address_array_with_huge_length__stops_at_end_of_data() {
        let data = [word_u(0x20), word_u(u128::from(u64::MAX))].concat();
        let err = Decoder::new(&data).address_array(0).unwrap_err();
        assert_eq!(
            err,
            AbiError::OutOfBounds {
                needed: 3 * WORD,
                actual: 2 * WORD
            }
        );
    }

    #[test]
    fn decode_revert__huge_string_length__reports_malformed_reason() {
        // given
        let mut data = ERROR_STRING_SELECTOR.to_vec();
        data.extend(word_u(0x20));
        data.extend(word_u(u128::from(u64::MAX)));

        // when
        let reason = decode_revert(&data).unwrap();

        // then
        assert!(reason.starts_with("malformed revert reason 0x"));
    }

    #[test]
    fn decoder__reads_bool_and_u64() {
        let data = [word_u(1), word_u(1_700_000_000)].concat();
        let decoder = Decoder::new(&data);
        assert_eq!(decoder.bool(0), Ok(true));
        assert_eq!(decoder.u64(1), Ok(1_700_000_000));
        assert_eq!(decoder.bool(1), Err(AbiError::InvalidBool));
    }

    #[test]
    fn decode_revert__extracts_error_string() {
        let payload = revert_payload("Ticket already reserved");
        assert_eq!(
            decode_revert(&payload).as_deref(),
            Some("Ticket already reserved")
        );
    }

    #[test]
    fn decode_revert__describes_panics_and_custom_errors() {
        let mut panic = PANIC_SELECTOR.to_vec();
        panic.extend(word_u(0x11));
        assert_eq!(
            decode_revert(&panic).as_deref(),
            Some("panic 0x11 (arithmetic overflow or underflow)")
        );
        assert_eq!(
            decode_revert(&[0xde, 0xad, 0xbe, 0xef]).as_deref(),
            Some("custom error 0xdeadbeef")
        );
        assert_eq!(decode_revert(&[]), None);
    }

    #[test]
    fn function__resolves_signature_and_mutability_from_descriptor() {
        // given
        let abi: Vec<AbiEntry> = serde_json::from_str(
            r#"[
                {"type":"constructor","inputs":[]},
                {"type":"function","name":"transferTicket","stateMutability":"nonpayable",
                 "inputs":[{"name":"_index","type":"uint256"},{"name":"_to","type":"address"}],
                 "outputs":[]},
                {"type":"function","name":"getReservation","stateMutability":"view",
                 "inputs":[{"name":"index","type":"uint256"}],
                 "outputs":[{"name":"","type":"tuple","components":[
                    {"name":"reserver","type":"address"},
                    {"name":"timestamp","type":"uint256"}]}]},
                {"type":"function","name":"buyTiket","payable":true,"constant":false,
                 "inputs":[{"name":"index","type":"uint256"}],"outputs":[]}
            ]"#,
        )
        .unwrap();

        // when
        let transfer = find_function(&abi, "transferTicket").unwrap();
        let reservation = find_function(&abi, "getReservation").unwrap();
        let buy = find_function(&abi, "buyTiket").unwrap();

        // then
        assert_eq!(transfer.signature, "transferTicket(uint256,address)");
        assert_eq!(transfer.selector, selector("transferTicket(uint256,address)"));
        assert!(!transfer.is_view);
        assert!(reservation.is_view);
        assert_eq!(reservation.output_word("reserver", "address"), Some(0));
        assert_eq!(reservation.output_word("timestamp", "uint256"), Some(1));
        assert!(buy.is_payable);
        assert_eq!(
            find_function(&abi, "getTikets"),
            Err(AbiError::MissingFunction("getTikets".to_string()))
        );
    }

    #[test]
    fn abi_param__canonical_type_expands_tuples() {
        let param = AbiParam {
            name: "r".into(),
            kind: "tuple[]".into(),
            components: vec![
                AbiParam {
                    name: "a".into(),
                    kind: "address".into(),
                    components: vec![],
                },
                AbiParam {
                    name: "t".into(),
                    kind: "uint256".into(),
                    components: vec![],
                },
            ],
        };
        assert_eq!(param.canonical_type(), "(address,uint256)[]");
    }
}
