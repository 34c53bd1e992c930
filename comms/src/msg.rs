use std::io;

type Header = u32;
const HEADER_SIZE: usize = size_of::<Header>();

const KIND_ERR: u8 = 0;
const KIND_CONTROL: u8 = 1;
const KIND_BLOB: u8 = 2;
const KIND_VALUES: u8 = 3;

/// The command for the `Control` variant of the `Msg` enum.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// First frame a spoke sends to the hub.
    Hello { rank: usize, node: String },
    /// The hub's answer once the whole group has joined.
    Ready { size: usize },
    Barrier,
    Disconnect,
}

/// The application layer message between group members.
#[derive(Debug, Clone, PartialEq)]
pub enum Msg {
    Control(Command),
    /// Opaque bytes, used by broadcast and all-gather.
    Blob(Vec<u8>),
    /// Numeric payload, used by all-reduce.
    Values(Vec<f64>),
    Err(String),
}

impl Msg {
    /// A short name for the message kind, used in errors and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Msg::Control(Command::Hello { .. }) => "control/hello",
            Msg::Control(Command::Ready { .. }) => "control/ready",
            Msg::Control(Command::Barrier) => "control/barrier",
            Msg::Control(Command::Disconnect) => "control/disconnect",
            Msg::Blob(_) => "data/blob",
            Msg::Values(_) => "data/values",
            Msg::Err(_) => "err",
        }
    }

    /// Appends the wire representation of this message to `buf`.
    ///
    /// # Arguments
    /// * `buf` - The buffer to write into.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Msg::Err(detail) => {
                buf.extend_from_slice(&(KIND_ERR as Header).to_be_bytes());
                buf.extend_from_slice(detail.as_bytes());
            }
            Msg::Control(cmd) => {
                buf.extend_from_slice(&(KIND_CONTROL as Header).to_be_bytes());

                // SAFETY: Serialize impl for `Command` is derived and not implemented
                //         by hand. Nor has a non string-key map inside.
                serde_json::to_writer(buf, cmd).unwrap();
            }
            Msg::Blob(bytes) => {
                buf.extend_from_slice(&(KIND_BLOB as Header).to_be_bytes());
                buf.extend_from_slice(bytes);
            }
            Msg::Values(values) => {
                buf.extend_from_slice(&(KIND_VALUES as Header).to_be_bytes());
                buf.extend_from_slice(bytemuck::cast_slice(values));
            }
        }
    }

    /// Parses a message from its wire representation.
    ///
    /// # Arguments
    /// * `buf` - A complete frame body, without the length prefix.
    ///
    /// # Returns
    /// The decoded message or an `InvalidData` io error.
    pub fn decode(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(invalid_data(format!(
                "The given buffer is too small {}, must at least be {HEADER_SIZE} bytes",
                buf.len()
            )));
        }

        let (kind_buf, rest) = buf.split_at(HEADER_SIZE);
        let mut header = [0; HEADER_SIZE];
        header.copy_from_slice(kind_buf);
        let kind = Header::from_be_bytes(header) as u8;

        match kind {
            KIND_ERR => {
                let detail = std::str::from_utf8(rest).map_err(invalid_data)?;
                Ok(Msg::Err(detail.to_string()))
            }
            KIND_CONTROL => {
                let cmd = serde_json::from_slice(rest)?;
                Ok(Msg::Control(cmd))
            }
            KIND_BLOB => Ok(Msg::Blob(rest.to_vec())),
            KIND_VALUES => {
                if rest.len() % size_of::<f64>() != 0 {
                    return Err(invalid_data(format!(
                        "values payload of {} bytes is not a multiple of 8",
                        rest.len()
                    )));
                }

                // The frame buffer carries no alignment guarantee for f64.
                Ok(Msg::Values(bytemuck::pod_collect_to_vec(rest)))
            }
            byte => Err(invalid_data(format!("Received an invalid kind byte {byte}"))),
        }
    }
}

fn invalid_data<E>(err: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}
