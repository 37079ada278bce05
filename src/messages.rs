use crate::error::{AddressParseError, WireError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{fmt, str::FromStr};

/// A node's network identity. Travels on the wire as `[host, port]`.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq, Hash)]
#[serde(from = "(String, u16)", into = "(String, u16)")]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    // the string a node's ring key is hashed from
    pub fn ring_name(&self) -> String {
        format!("{}{}", self.host, self.port)
    }
}

impl From<(String, u16)> for Address {
    fn from((host, port): (String, u16)) -> Self {
        Self { host, port }
    }
}

impl From<Address> for (String, u16) {
    fn from(addr: Address) -> Self {
        (addr.host, addr.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressParseError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(AddressParseError::MissingPort(s.to_string()));
        }
        let port = port
            .parse()
            .map_err(|_| AddressParseError::InvalidPort(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Every message exchanged between ring members. The sender is always the
/// last element on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RingMessage {
    // a new node asking to be placed in the ring
    Join {
        key: u64,
        sender: Address,
    },
    // sent straight to the joiner by the node that placed it
    JoinResponse {
        successor: Address,
        predecessor: Address,
        sender: Address,
    },
    // a leaving node telling its predecessor who comes next
    SuccLeft {
        new_successor: Address,
        sender: Address,
    },
    UpdatePred {
        new_predecessor: Address,
        sender: Address,
    },
    // a leaving node handing its file lists to its successor
    PredLeft {
        files: Vec<String>,
        backup_files: Vec<String>,
        sender: Address,
    },
    // sender is the node the put started from, unchanged across hops
    Put {
        filename: String,
        sender: Address,
    },
    // sender is the requesting node, unchanged across hops
    Get {
        filename: String,
        sender: Address,
    },
    GetResponse {
        filename: String,
        sender: Address,
    },
    NotFound {
        filename: String,
        sender: Address,
    },
    Ping {
        files: Vec<String>,
        sender: Address,
    },
    PingResponse {
        files: Vec<String>,
        successor: Address,
        sender: Address,
    },
}

impl RingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            RingMessage::Join { .. } => "join",
            RingMessage::JoinResponse { .. } => "join_response",
            RingMessage::SuccLeft { .. } => "succ_left",
            RingMessage::UpdatePred { .. } => "update_pred",
            RingMessage::PredLeft { .. } => "pred_left",
            RingMessage::Put { .. } => "put",
            RingMessage::Get { .. } => "get",
            RingMessage::GetResponse { .. } => "get_response",
            RingMessage::NotFound { .. } => "Not_found",
            RingMessage::Ping { .. } => "ping",
            RingMessage::PingResponse { .. } => "ping_response",
        }
    }

    pub fn sender(&self) -> &Address {
        match self {
            RingMessage::Join { sender, .. }
            | RingMessage::JoinResponse { sender, .. }
            | RingMessage::SuccLeft { sender, .. }
            | RingMessage::UpdatePred { sender, .. }
            | RingMessage::PredLeft { sender, .. }
            | RingMessage::Put { sender, .. }
            | RingMessage::Get { sender, .. }
            | RingMessage::GetResponse { sender, .. }
            | RingMessage::NotFound { sender, .. }
            | RingMessage::Ping { sender, .. }
            | RingMessage::PingResponse { sender, .. } => sender,
        }
    }

    /// The positional JSON array form: `[type, field..., sender]`.
    pub fn to_value(&self) -> Value {
        let kind = self.kind();
        match self {
            RingMessage::Join { key, sender } => json!([kind, key, sender]),
            RingMessage::JoinResponse {
                successor,
                predecessor,
                sender,
            } => json!([kind, successor, predecessor, sender]),
            RingMessage::SuccLeft {
                new_successor,
                sender,
            } => json!([kind, new_successor, sender]),
            RingMessage::UpdatePred {
                new_predecessor,
                sender,
            } => json!([kind, new_predecessor, sender]),
            RingMessage::PredLeft {
                files,
                backup_files,
                sender,
            } => json!([kind, files, backup_files, sender]),
            RingMessage::Put { filename, sender }
            | RingMessage::Get { filename, sender }
            | RingMessage::GetResponse { filename, sender }
            | RingMessage::NotFound { filename, sender } => json!([kind, filename, sender]),
            RingMessage::Ping { files, sender } => json!([kind, files, sender]),
            RingMessage::PingResponse {
                files,
                successor,
                sender,
            } => json!([kind, files, successor, sender]),
        }
    }

    pub fn from_value(value: Value) -> Result<Self, WireError> {
        let Value::Array(items) = value else {
            return Err(WireError::Malformed("expected a JSON array".into()));
        };
        let mut fields = Fields::new(items)?;
        let kind = fields.kind.clone();
        let msg = match kind.as_str() {
            "join" => RingMessage::Join {
                key: fields.next()?,
                sender: fields.next()?,
            },
            "join_response" => RingMessage::JoinResponse {
                successor: fields.next()?,
                predecessor: fields.next()?,
                sender: fields.next()?,
            },
            "succ_left" => RingMessage::SuccLeft {
                new_successor: fields.next()?,
                sender: fields.next()?,
            },
            "update_pred" => RingMessage::UpdatePred {
                new_predecessor: fields.next()?,
                sender: fields.next()?,
            },
            "pred_left" => RingMessage::PredLeft {
                files: fields.next()?,
                backup_files: fields.next()?,
                sender: fields.next()?,
            },
            "put" => RingMessage::Put {
                filename: fields.next()?,
                sender: fields.next()?,
            },
            "get" => RingMessage::Get {
                filename: fields.next()?,
                sender: fields.next()?,
            },
            "get_response" => RingMessage::GetResponse {
                filename: fields.next()?,
                sender: fields.next()?,
            },
            "Not_found" => RingMessage::NotFound {
                filename: fields.next()?,
                sender: fields.next()?,
            },
            "ping" => RingMessage::Ping {
                files: fields.next()?,
                sender: fields.next()?,
            },
            "ping_response" => RingMessage::PingResponse {
                files: fields.next()?,
                successor: fields.next()?,
                sender: fields.next()?,
            },
            other => return Err(WireError::UnknownType(other.to_string())),
        };
        fields.finish()?;
        Ok(msg)
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(&self.to_value())?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        Self::from_value(serde_json::from_slice(bytes)?)
    }
}

// positional reader over the elements after the type tag
struct Fields {
    kind: String,
    items: std::vec::IntoIter<Value>,
    position: usize,
}

impl Fields {
    fn new(items: Vec<Value>) -> Result<Self, WireError> {
        let mut items = items.into_iter();
        let kind = match items.next() {
            Some(Value::String(kind)) => kind,
            Some(other) => {
                return Err(WireError::Malformed(format!(
                    "type tag must be a string, got {other}"
                )))
            }
            None => return Err(WireError::Malformed("empty message".into())),
        };
        Ok(Self {
            kind,
            items,
            position: 1,
        })
    }

    fn next<T: DeserializeOwned>(&mut self) -> Result<T, WireError> {
        let value = self.items.next().ok_or_else(|| {
            WireError::Malformed(format!("{} is missing field {}", self.kind, self.position))
        })?;
        self.position += 1;
        serde_json::from_value(value).map_err(|e| {
            WireError::Malformed(format!(
                "{} field {}: {}",
                self.kind,
                self.position - 1,
                e
            ))
        })
    }

    fn finish(mut self) -> Result<(), WireError> {
        match self.items.next() {
            None => Ok(()),
            Some(_) => Err(WireError::Malformed(format!(
                "{} has more than {} fields",
                self.kind,
                self.position - 1
            ))),
        }
    }
}
