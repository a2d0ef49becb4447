use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PacketError, Result};
use crate::types::{ChannelMode, ExitStatus, ProcessError, ProcessMode};

/// Frame header: length (4) + tag (1) + reserved (1) + token (4) = 10 bytes.
pub const HEADER_SIZE: usize = 10;

/// Bytes covered by the length field: everything after the length itself.
const LENGTH_COVERS: usize = HEADER_SIZE - 4;

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Packet type tags.
///
/// The first four travel caller → helper, the rest helper → caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Shutdown = 0,
    StartProcess = 1,
    WriteProcess = 2,
    StopProcess = 3,
    ProcessError = 4,
    ProcessStarted = 5,
    StandardOutput = 6,
    StandardError = 7,
    ProcessFinished = 8,
}

impl PacketType {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Shutdown),
            1 => Some(Self::StartProcess),
            2 => Some(Self::WriteProcess),
            3 => Some(Self::StopProcess),
            4 => Some(Self::ProcessError),
            5 => Some(Self::ProcessStarted),
            6 => Some(Self::StandardOutput),
            7 => Some(Self::StandardError),
            8 => Some(Self::ProcessFinished),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Whether this packet type flows helper → caller.
    pub fn is_helper_report(self) -> bool {
        matches!(
            self,
            Self::ProcessError
                | Self::ProcessStarted
                | Self::StandardOutput
                | Self::StandardError
                | Self::ProcessFinished
        )
    }
}

/// The full configuration snapshot a caller sends exactly once per process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartProcessPayload {
    pub program: String,
    pub arguments: Vec<String>,
    pub working_dir: String,
    /// `KEY=VALUE` entries.
    pub environment: Vec<String>,
    pub process_mode: ProcessMode,
    /// Delivered to the child's stdin right after it starts.
    pub write_data: Bytes,
    pub channel_mode: ChannelMode,
    pub stdin_file_path: String,
    pub below_normal_priority: bool,
    pub native_arguments: String,
    pub low_priority: bool,
    pub unix_terminal_disabled: bool,
}

/// The helper's final report for one process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessFinishedPayload {
    pub message: String,
    /// Trailing output collected between the last read and process exit.
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub exit_status: ExitStatus,
    pub error: ProcessError,
    pub exit_code: i32,
}

/// A decoded packet, without its routing token.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Shutdown,
    StartProcess(StartProcessPayload),
    WriteProcess { data: Bytes },
    StopProcess,
    ProcessError { error: ProcessError, message: String },
    ProcessStarted { process_id: u32 },
    StandardOutput { data: Bytes },
    StandardError { data: Bytes },
    ProcessFinished(ProcessFinishedPayload),
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Shutdown => PacketType::Shutdown,
            Packet::StartProcess(_) => PacketType::StartProcess,
            Packet::WriteProcess { .. } => PacketType::WriteProcess,
            Packet::StopProcess => PacketType::StopProcess,
            Packet::ProcessError { .. } => PacketType::ProcessError,
            Packet::ProcessStarted { .. } => PacketType::ProcessStarted,
            Packet::StandardOutput { .. } => PacketType::StandardOutput,
            Packet::StandardError { .. } => PacketType::StandardError,
            Packet::ProcessFinished(_) => PacketType::ProcessFinished,
        }
    }

    /// Encode this packet into a self-delimited frame routed by `token`.
    pub fn encode(&self, token: u32) -> Bytes {
        let mut payload = BytesMut::new();
        self.encode_payload(&mut payload);

        let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        frame.put_u32_le((LENGTH_COVERS + payload.len()) as u32);
        frame.put_u8(self.packet_type().tag());
        frame.put_u8(0);
        frame.put_u32_le(token);
        frame.put(payload);
        frame.freeze()
    }

    fn encode_payload(&self, dst: &mut BytesMut) {
        match self {
            Packet::Shutdown | Packet::StopProcess => {}
            Packet::StartProcess(p) => {
                put_string(dst, &p.program);
                put_string_list(dst, &p.arguments);
                put_string(dst, &p.working_dir);
                put_string_list(dst, &p.environment);
                dst.put_u8(p.process_mode.tag());
                put_blob(dst, &p.write_data);
                dst.put_u8(p.channel_mode.tag());
                put_string(dst, &p.stdin_file_path);
                put_bool(dst, p.below_normal_priority);
                put_string(dst, &p.native_arguments);
                put_bool(dst, p.low_priority);
                put_bool(dst, p.unix_terminal_disabled);
            }
            Packet::WriteProcess { data } => put_blob(dst, data),
            Packet::ProcessError { error, message } => {
                dst.put_u8(error.tag());
                put_string(dst, message);
            }
            Packet::ProcessStarted { process_id } => dst.put_u32_le(*process_id),
            Packet::StandardOutput { data } | Packet::StandardError { data } => {
                put_blob(dst, data)
            }
            Packet::ProcessFinished(p) => {
                put_string(dst, &p.message);
                put_blob(dst, &p.stdout);
                put_blob(dst, &p.stderr);
                dst.put_u8(p.exit_status.tag());
                dst.put_u8(p.error.tag());
                dst.put_i32_le(p.exit_code);
            }
        }
    }

    /// Decode a payload previously framed with `packet_type`'s tag.
    pub fn decode(packet_type: PacketType, mut payload: Bytes) -> Result<Self> {
        let src = &mut payload;
        let packet = match packet_type {
            PacketType::Shutdown => Packet::Shutdown,
            PacketType::StopProcess => Packet::StopProcess,
            PacketType::StartProcess => {
                let program = take_string(src, "StartProcess")?;
                let arguments = take_string_list(src, "StartProcess")?;
                let working_dir = take_string(src, "StartProcess")?;
                let environment = take_string_list(src, "StartProcess")?;
                let process_mode = take_enum(src, "process_mode", ProcessMode::from_tag)?;
                let write_data = take_blob(src, "StartProcess")?;
                let channel_mode = take_enum(src, "channel_mode", ChannelMode::from_tag)?;
                let stdin_file_path = take_string(src, "StartProcess")?;
                let below_normal_priority = take_bool(src, "StartProcess")?;
                let native_arguments = take_string(src, "StartProcess")?;
                let low_priority = take_bool(src, "StartProcess")?;
                let unix_terminal_disabled = take_bool(src, "StartProcess")?;
                Packet::StartProcess(StartProcessPayload {
                    program,
                    arguments,
                    working_dir,
                    environment,
                    process_mode,
                    write_data,
                    channel_mode,
                    stdin_file_path,
                    below_normal_priority,
                    native_arguments,
                    low_priority,
                    unix_terminal_disabled,
                })
            }
            PacketType::WriteProcess => Packet::WriteProcess {
                data: take_blob(src, "WriteProcess")?,
            },
            PacketType::ProcessError => Packet::ProcessError {
                error: take_enum(src, "process_error", ProcessError::from_tag)?,
                message: take_string(src, "ProcessError")?,
            },
            PacketType::ProcessStarted => Packet::ProcessStarted {
                process_id: take_u32(src, "ProcessStarted")?,
            },
            PacketType::StandardOutput => Packet::StandardOutput {
                data: take_blob(src, "StandardOutput")?,
            },
            PacketType::StandardError => Packet::StandardError {
                data: take_blob(src, "StandardError")?,
            },
            PacketType::ProcessFinished => {
                let message = take_string(src, "ProcessFinished")?;
                let stdout = take_blob(src, "ProcessFinished")?;
                let stderr = take_blob(src, "ProcessFinished")?;
                let exit_status = take_enum(src, "exit_status", ExitStatus::from_tag)?;
                let error = take_enum(src, "process_error", ProcessError::from_tag)?;
                let exit_code = take_i32(src, "ProcessFinished")?;
                Packet::ProcessFinished(ProcessFinishedPayload {
                    message,
                    stdout,
                    stderr,
                    exit_status,
                    error,
                    exit_code,
                })
            }
        };
        Ok(packet)
    }
}

/// Decode one frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't hold a complete frame yet.
/// On success, consumes the frame bytes and yields `(token, packet)`.
pub fn decode_packet(src: &mut BytesMut, max_payload: usize) -> Result<Option<(u32, Packet)>> {
    if src.len() < 4 {
        return Ok(None); // Need more data
    }

    let length = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if length < LENGTH_COVERS || length > LENGTH_COVERS + max_payload {
        return Err(PacketError::InvalidSize {
            size: length,
            min: LENGTH_COVERS,
            max: LENGTH_COVERS + max_payload,
        });
    }

    if src.len() < 4 + length {
        return Ok(None); // Need more data
    }

    src.advance(4);
    let tag = src.get_u8();
    let _reserved = src.get_u8();
    let token = src.get_u32_le();
    let payload = src.split_to(length - LENGTH_COVERS).freeze();

    let packet_type = PacketType::from_tag(tag).ok_or(PacketError::UnknownType { tag })?;
    let packet = Packet::decode(packet_type, payload)?;
    Ok(Some((token, packet)))
}

fn need(src: &Bytes, n: usize, packet: &'static str) -> Result<()> {
    if src.len() < n {
        return Err(PacketError::Truncated { packet });
    }
    Ok(())
}

fn put_bool(dst: &mut BytesMut, value: bool) {
    dst.put_u8(u8::from(value));
}

fn put_blob(dst: &mut BytesMut, data: &[u8]) {
    dst.put_u32_le(data.len() as u32);
    dst.put_slice(data);
}

fn put_string(dst: &mut BytesMut, s: &str) {
    put_blob(dst, s.as_bytes());
}

fn put_string_list(dst: &mut BytesMut, list: &[String]) {
    dst.put_u32_le(list.len() as u32);
    for s in list {
        put_string(dst, s);
    }
}

fn take_u8(src: &mut Bytes, packet: &'static str) -> Result<u8> {
    need(src, 1, packet)?;
    Ok(src.get_u8())
}

fn take_u32(src: &mut Bytes, packet: &'static str) -> Result<u32> {
    need(src, 4, packet)?;
    Ok(src.get_u32_le())
}

fn take_i32(src: &mut Bytes, packet: &'static str) -> Result<i32> {
    need(src, 4, packet)?;
    Ok(src.get_i32_le())
}

fn take_bool(src: &mut Bytes, packet: &'static str) -> Result<bool> {
    Ok(take_u8(src, packet)? != 0)
}

fn take_blob(src: &mut Bytes, packet: &'static str) -> Result<Bytes> {
    let len = take_u32(src, packet)? as usize;
    need(src, len, packet)?;
    Ok(src.split_to(len))
}

fn take_string(src: &mut Bytes, packet: &'static str) -> Result<String> {
    let bytes = take_blob(src, packet)?;
    Ok(String::from_utf8(bytes.to_vec())?)
}

fn take_string_list(src: &mut Bytes, packet: &'static str) -> Result<Vec<String>> {
    let count = take_u32(src, packet)? as usize;
    let mut list = Vec::new();
    for _ in 0..count {
        list.push(take_string(src, packet)?);
    }
    Ok(list)
}

fn take_enum<T>(
    src: &mut Bytes,
    field: &'static str,
    from_tag: impl Fn(u8) -> Option<T>,
) -> Result<T> {
    let value = take_u8(src, field)?;
    from_tag(value).ok_or(PacketError::InvalidField { field, value })
}
