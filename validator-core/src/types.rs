//! Plain data exchanged between the validator and the execution engine.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ValidatorError;

/// A 32-byte content digest.
///
/// Displayed as `0x`-prefixed lowercase hex, which is also the directory name
/// a module root's images live under.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bytes32(pub [u8; 32]);

/// Content hash identifying one compiled machine image.
pub type ModuleRoot = Bytes32;

impl Bytes32 {
    pub const ZERO: Bytes32 = Bytes32([0u8; 32]);

    /// SHA-256 of `data`.
    pub fn digest(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Bytes32 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Bytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Bytes32 {
    type Err = ValidatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let raw = hex::decode(digits)
            .map_err(|e| ValidatorError::InvalidInput(format!("bad hex digest {s:?}: {e}")))?;
        let bytes: [u8; 32] = raw.try_into().map_err(|raw: Vec<u8>| {
            ValidatorError::InvalidInput(format!("digest must be 32 bytes, got {}", raw.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for Bytes32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Bytes32 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The machine's externally visible state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalState {
    pub block_hash: Bytes32,
    pub send_root: Bytes32,
    pub batch: u64,
    pub pos_in_batch: u64,
}

impl GlobalState {
    /// Digest committing to every field, used when comparing claims.
    pub fn hash(&self) -> Bytes32 {
        let mut hasher = Sha256::new();
        hasher.update(b"Global state:");
        hasher.update(self.block_hash.0);
        hasher.update(self.send_root.0);
        hasher.update(self.batch.to_be_bytes());
        hasher.update(self.pos_in_batch.to_be_bytes());
        Bytes32(hasher.finalize().into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MachineStatus {
    Running,
    Finished,
    Errored,
    /// Halted because the machine asked for input beyond what was supplied.
    TooFar,
}

impl MachineStatus {
    /// Wire encoding shared with the engine C ABI.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Running),
            1 => Some(Self::Finished),
            2 => Some(Self::Errored),
            3 => Some(Self::TooFar),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Finished => 1,
            Self::Errored => 2,
            Self::TooFar => 3,
        }
    }

    /// A halted machine's state is final for every later step index.
    pub fn is_halted(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Finished => write!(f, "finished"),
            Self::Errored => write!(f, "errored"),
            Self::TooFar => write!(f, "too-far"),
        }
    }
}

/// The two inbox streams a machine reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InboxKind {
    Sequencer,
    Delayed,
}

impl InboxKind {
    pub fn as_u64(self) -> u64 {
        match self {
            Self::Sequencer => 0,
            Self::Delayed => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxMessage {
    pub index: u64,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl InboxMessage {
    pub fn new(index: u64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            index,
            data: data.into(),
        }
    }
}

/// Everything a spawner needs to re-execute one state transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ValidationInput {
    pub id: u64,
    pub start_state: GlobalState,
    pub sequencer_messages: Vec<InboxMessage>,
    pub delayed_messages: Vec<InboxMessage>,
    #[serde(with = "hex_preimages")]
    pub preimages: HashMap<Bytes32, Vec<u8>>,
}

impl ValidationInput {
    pub fn new(id: u64, start_state: GlobalState) -> Self {
        Self {
            id,
            start_state,
            ..Default::default()
        }
    }

    pub fn with_sequencer_message(mut self, index: u64, data: impl Into<Vec<u8>>) -> Self {
        self.sequencer_messages.push(InboxMessage::new(index, data));
        self
    }

    pub fn with_delayed_message(mut self, index: u64, data: impl Into<Vec<u8>>) -> Self {
        self.delayed_messages.push(InboxMessage::new(index, data));
        self
    }

    /// Register `data` under its own SHA-256 digest and return the digest.
    pub fn add_preimage(&mut self, data: impl Into<Vec<u8>>) -> Bytes32 {
        let data = data.into();
        let hash = Bytes32::digest(&data);
        self.preimages.insert(hash, data);
        hash
    }

    pub fn from_json_file(path: &std::path::Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| ValidatorError::InvalidInput(format!("{}: {e}", path.display())))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(data)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

mod hex_preimages {
    use super::Bytes32;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::{BTreeMap, HashMap};

    pub fn serialize<S: Serializer>(
        map: &HashMap<Bytes32, Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let ordered: BTreeMap<String, String> = map
            .iter()
            .map(|(k, v)| (k.to_string(), format!("0x{}", hex::encode(v))))
            .collect();
        serializer.collect_map(ordered)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<Bytes32, Vec<u8>>, D::Error> {
        let raw = HashMap::<Bytes32, String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(k, v)| {
                hex::decode(v.trim_start_matches("0x"))
                    .map(|bytes| (k, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes32_display_and_parse() {
        let root = Bytes32::from([0x11; 32]);
        let text = root.to_string();
        assert!(text.starts_with("0x1111"));
        assert_eq!(text.len(), 66);
        assert_eq!(text.parse::<Bytes32>().unwrap(), root);
        assert_eq!(text[2..].parse::<Bytes32>().unwrap(), root);
    }

    #[test]
    fn test_bytes32_rejects_wrong_length() {
        assert!("0x1234".parse::<Bytes32>().is_err());
        assert!("zz".parse::<Bytes32>().is_err());
    }

    #[test]
    fn test_status_halted() {
        assert!(!MachineStatus::Running.is_halted());
        assert!(MachineStatus::Finished.is_halted());
        assert!(MachineStatus::Errored.is_halted());
        assert!(MachineStatus::TooFar.is_halted());
        for status in [
            MachineStatus::Running,
            MachineStatus::Finished,
            MachineStatus::Errored,
            MachineStatus::TooFar,
        ] {
            assert_eq!(MachineStatus::from_u8(status.as_u8()), Some(status));
        }
        assert_eq!(MachineStatus::from_u8(9), None);
    }

    #[test]
    fn test_global_state_hash_covers_positions() {
        let a = GlobalState::default();
        let mut b = a;
        b.pos_in_batch = 1;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_validation_input_json() {
        let mut input = ValidationInput::new(7, GlobalState::default())
            .with_sequencer_message(0, b"hello".to_vec());
        let hash = input.add_preimage(b"preimage".to_vec());

        let json = serde_json::to_string(&input).unwrap();
        assert!(json.contains("sequencerMessages"));
        let back: ValidationInput = serde_json::from_str(&json).unwrap();
        assert_eq!(back, input);
        assert_eq!(back.preimages[&hash], b"preimage".to_vec());
    }
}
