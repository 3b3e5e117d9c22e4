//! Кадры data channel: один JSON-объект на сообщение, вид кадра задаёт поле `type`.

use crate::error::ProtocolError;
use crate::utils::safe_file_name;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SystemSignal {
    Disconnect,
}

/// Один кусок передаваемого файла
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FileChunk {
    pub filename: String,
    pub ext: String,
    pub chunk_id: u32,
    pub total_chunks: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub timestamp: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Chat { username: String, msg: String },
    UsernameAnnounce { username_announce: String },
    System { system: SystemSignal },
    FileChunk(FileChunk),
}

impl Frame {
    pub fn chat(username: impl Into<String>, msg: impl Into<String>) -> Self {
        Frame::Chat {
            username: username.into(),
            msg: msg.into(),
        }
    }

    pub fn announce(username: impl Into<String>) -> Self {
        Frame::UsernameAnnounce {
            username_announce: username.into(),
        }
    }

    pub fn disconnect() -> Self {
        Frame::System {
            system: SystemSignal::Disconnect,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, ProtocolError> {
        let frame: Frame = serde_json::from_slice(raw)?;
        if let Frame::FileChunk(chunk) = &frame {
            chunk.validate()?;
        }
        Ok(frame)
    }
}

impl FileChunk {
    /// Геометрия куска: индекс внутри объявленного количества, имя пригодно для диска
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.total_chunks == 0 {
            return Err(ProtocolError::InvalidChunk(format!(
                "{}: total_chunks is zero",
                self.filename
            )));
        }
        if self.chunk_id >= self.total_chunks {
            return Err(ProtocolError::InvalidChunk(format!(
                "{}: chunk_id {} out of range 0..{}",
                self.filename, self.chunk_id, self.total_chunks
            )));
        }
        if safe_file_name(&self.filename).is_none() {
            return Err(ProtocolError::InvalidChunk(format!(
                "unusable filename {:?}",
                self.filename
            )));
        }
        Ok(())
    }

    /// Сколько сырых байт помещается в кадр куска длиной не больше `limit`.
    /// Номера берутся максимальными, base64 кодирует каждые 3 байта в 4 символа.
    pub fn payload_capacity(
        filename: &str,
        ext: &str,
        timestamp: f64,
        limit: usize,
    ) -> Result<usize, ProtocolError> {
        let empty = Frame::FileChunk(FileChunk {
            filename: filename.to_string(),
            ext: ext.to_string(),
            chunk_id: u32::MAX,
            total_chunks: u32::MAX,
            data: Vec::new(),
            timestamp,
        });
        let overhead = empty.encode()?.len();
        Ok(limit.saturating_sub(overhead) / 4 * 3)
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
