//! Wire format of one RPC frame. Integers are 32-bit big-endian.
//!
//! ```text
//! START(0x02) total_len msg_id_len msg_id method_len method err_code err_info_len err_info payload checksum END(0x03)
//! ```
//! `total_len` counts every byte from START to END inclusive.
//! `checksum` is always written as 1 and is not checked on decode.

use crate::tcp_buffer::TcpBuffer;
use crate::{dbglog, logerr, msg_id};
use thiserror::Error;

pub const PB_START: u8 = 0x02;
pub const PB_END: u8 = 0x03;
/// START + 6 ints + END.
pub const MIN_FRAME_LEN: usize = 26;
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
/// Value of the checksum field on every encoded frame.
pub const PB_CHECKSUM: i32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcFrame {
    pub msg_id: String,
    /// `Service.method`
    pub method_name: String,
    pub err_code: i32,
    pub err_info: String,
    pub payload: Vec<u8>,
}

impl RpcFrame {
    pub fn new(msg_id: impl Into<String>, method_name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            msg_id: msg_id.into(),
            method_name: method_name.into(),
            err_code: 0,
            err_info: String::new(),
            payload,
        }
    }

    /// Encoded size of this frame.
    pub fn frame_len(&self) -> usize {
        MIN_FRAME_LEN
            + self.msg_id.len()
            + self.method_name.len()
            + self.err_info.len()
            + self.payload.len()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("field {0} overruns frame")]
    Overrun(&'static str),
    #[error("negative length of field {0}")]
    NegativeLen(&'static str),
    #[error("field {0} is not utf-8")]
    NotUtf8(&'static str),
}

/// Encodes frames into and decodes frames out of a TcpBuffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCoder;

impl FrameCoder {
    pub fn new() -> Self {
        Self
    }

    /// Append one encoded frame. An empty msg id is replaced by a generated one, kept in `frame`.
    pub fn encode(&self, frame: &mut RpcFrame, out: &mut TcpBuffer) {
        if frame.msg_id.is_empty() {
            frame.msg_id = msg_id::next_msg_id();
        }
        out.write(&encode_frame(frame));
    }

    /// Extract every complete frame. A trailing partial frame is left in the buffer.
    ///
    /// Bytes before a START marker and frames that fail to parse are discarded and logged.
    pub fn decode(&self, buf: &mut TcpBuffer) -> Vec<RpcFrame> {
        let mut frames = Vec::new();
        loop {
            let step = next_step(buf.readable_slice());
            match step {
                DecodeStep::Wait { skip } => {
                    if skip > 0 {
                        dbglog!("discarded {} bytes before frame start", skip);
                        buf.advance_read(skip);
                    }
                    break;
                }
                DecodeStep::Skip(n) => {
                    buf.advance_read(n);
                }
                DecodeStep::Frame { skip, len } => {
                    let parsed = {
                        let data = buf.readable_slice();
                        parse_frame(&data[skip..skip + len])
                    };
                    buf.advance_read(skip + len);
                    match parsed {
                        Ok(frame) => frames.push(frame),
                        Err(e) => logerr!("failed to parse frame of {} bytes: {}", len, e),
                    }
                }
            }
        }
        frames
    }
}

enum DecodeStep {
    /// Need more bytes. Drop `skip` leading garbage bytes first.
    Wait { skip: usize },
    /// Not a frame start, drop `n` bytes and rescan.
    Skip(usize),
    /// A complete candidate frame at `skip..skip+len`.
    Frame { skip: usize, len: usize },
}

fn next_step(data: &[u8]) -> DecodeStep {
    let Some(start) = data.iter().position(|b| *b == PB_START) else {
        return DecodeStep::Wait { skip: data.len() };
    };
    let data = &data[start..];
    if data.len() < 5 {
        return DecodeStep::Wait { skip: start };
    }
    let total_len = read_i32(&data[1..5]);
    if total_len < MIN_FRAME_LEN as i32 || total_len as usize > MAX_FRAME_LEN {
        return DecodeStep::Skip(start + 1);
    }
    let total_len = total_len as usize;
    if data.len() < total_len {
        return DecodeStep::Wait { skip: start };
    }
    if data[total_len - 1] != PB_END {
        return DecodeStep::Skip(start + 1);
    }
    DecodeStep::Frame {
        skip: start,
        len: total_len,
    }
}

fn read_i32(b: &[u8]) -> i32 {
    i32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

pub fn encode_frame(frame: &RpcFrame) -> Vec<u8> {
    let total_len = frame.frame_len();
    let mut out = Vec::with_capacity(total_len);
    out.push(PB_START);
    out.extend_from_slice(&(total_len as i32).to_be_bytes());
    out.extend_from_slice(&(frame.msg_id.len() as i32).to_be_bytes());
    out.extend_from_slice(frame.msg_id.as_bytes());
    out.extend_from_slice(&(frame.method_name.len() as i32).to_be_bytes());
    out.extend_from_slice(frame.method_name.as_bytes());
    out.extend_from_slice(&frame.err_code.to_be_bytes());
    out.extend_from_slice(&(frame.err_info.len() as i32).to_be_bytes());
    out.extend_from_slice(frame.err_info.as_bytes());
    out.extend_from_slice(&frame.payload);
    out.extend_from_slice(&PB_CHECKSUM.to_be_bytes());
    out.push(PB_END);
    debug_assert_eq!(out.len(), total_len);
    out
}

/// Parse one frame delimited by START and END.
pub fn parse_frame(frame: &[u8]) -> Result<RpcFrame, FrameError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(FrameError::Overrun("frame"));
    }
    // checksum sits right before END.
    let checksum_index = frame.len() - 5;
    let mut cursor = FieldCursor {
        data: &frame[..checksum_index],
        pos: 5,
    };
    let msg_id = cursor.string("msg_id")?;
    let method_name = cursor.string("method_name")?;
    let err_code = cursor.int("err_code")?;
    let err_info = cursor.string("err_info")?;
    let payload = cursor.data[cursor.pos..].to_vec();

    let check = read_i32(&frame[checksum_index..checksum_index + 4]);
    if check != PB_CHECKSUM {
        dbglog!("{} | unexpected checksum field {}", msg_id, check);
    }
    Ok(RpcFrame {
        msg_id,
        method_name,
        err_code,
        err_info,
        payload,
    })
}

struct FieldCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl FieldCursor<'_> {
    fn int(&mut self, field: &'static str) -> Result<i32, FrameError> {
        if self.pos + 4 > self.data.len() {
            return Err(FrameError::Overrun(field));
        }
        let v = read_i32(&self.data[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(v)
    }

    fn string(&mut self, field: &'static str) -> Result<String, FrameError> {
        let len = self.int(field)?;
        if len < 0 {
            return Err(FrameError::NegativeLen(field));
        }
        let len = len as usize;
        if self.pos + len > self.data.len() {
            return Err(FrameError::Overrun(field));
        }
        let s = std::str::from_utf8(&self.data[self.pos..self.pos + len])
            .map_err(|_| FrameError::NotUtf8(field))?
            .to_owned();
        self.pos += len;
        Ok(s)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> RpcFrame {
        RpcFrame {
            msg_id: "123456789".to_owned(),
            method_name: "Order.makeOrder".to_owned(),
            err_code: 0,
            err_info: String::new(),
            payload: b"{\"price\":100}".to_vec(),
        }
    }

    #[test]
    pub fn test_encode_layout() {
        let f = sample();
        let bytes = encode_frame(&f);
        assert_eq!(bytes.len(), 26 + 9 + 15 + 13);
        assert_eq!(bytes[0], PB_START);
        assert_eq!(*bytes.last().unwrap(), PB_END);
        assert_eq!(read_i32(&bytes[1..5]) as usize, bytes.len());
        assert_eq!(read_i32(&bytes[5..9]), 9);
        assert_eq!(&bytes[9..18], b"123456789");
    }

    #[test]
    pub fn test_err_info_round_trip() {
        let mut f = sample();
        f.err_code = crate::ERROR_METHOD_NOT_FOUND;
        f.err_info = "méthode introuvable: makeOrder".to_owned();
        f.payload.clear();
        let mut buf = TcpBuffer::default();
        FrameCoder.encode(&mut f.clone(), &mut buf);
        let frames = FrameCoder.decode(&mut buf);
        assert_eq!(frames, vec![f]);
    }

    #[test]
    pub fn test_generated_msg_id() {
        let mut f = sample();
        f.msg_id.clear();
        let mut buf = TcpBuffer::default();
        FrameCoder.encode(&mut f, &mut buf);
        assert_eq!(f.msg_id.len(), msg_id::MSG_ID_LENGTH);
        assert_eq!(FrameCoder.decode(&mut buf)[0].msg_id, f.msg_id);
    }

    #[test]
    pub fn test_truncated_frame_waits() {
        let bytes = encode_frame(&sample());
        let mut buf = TcpBuffer::default();
        buf.write(&bytes[..bytes.len() - 1]);
        let (r, w) = (buf.read_index(), buf.write_index());
        assert!(FrameCoder.decode(&mut buf).is_empty());
        assert_eq!((buf.read_index(), buf.write_index()), (r, w));

        buf.write(&bytes[bytes.len() - 1..]);
        assert_eq!(FrameCoder.decode(&mut buf), vec![sample()]);
        assert_eq!(buf.readable(), 0);
    }

    #[test]
    pub fn test_back_to_back_and_garbage() {
        let mut second = sample();
        second.msg_id = "2".to_owned();
        let mut buf = TcpBuffer::default();
        buf.write(b"\x00\xffgarbage");
        buf.write(&encode_frame(&sample()));
        buf.write(&encode_frame(&second));
        let frames = FrameCoder.decode(&mut buf);
        assert_eq!(frames, vec![sample(), second]);
        assert_eq!(buf.readable(), 0);
    }

    #[test]
    pub fn test_checksum_field_ignored() {
        let mut bytes = encode_frame(&sample());
        let n = bytes.len();
        assert_eq!(read_i32(&bytes[n - 5..n - 1]), PB_CHECKSUM);
        let mut buf = TcpBuffer::default();
        buf.write(&bytes);
        assert_eq!(FrameCoder.decode(&mut buf), vec![sample()]);

        bytes[n - 5..n - 1].copy_from_slice(&0x7eadbeefi32.to_be_bytes());
        buf.write(&bytes);
        assert_eq!(FrameCoder.decode(&mut buf), vec![sample()]);
    }

    #[test]
    pub fn test_corrupted_frame_skipped() {
        let mut bad = encode_frame(&sample());
        // method_len pointing past the checksum field.
        bad[18..22].copy_from_slice(&500i32.to_be_bytes());
        let mut buf = TcpBuffer::default();
        buf.write(&bad);
        buf.write(&encode_frame(&sample()));
        assert_eq!(FrameCoder.decode(&mut buf), vec![sample()]);

        // a start byte followed by an impossible length is skipped.
        buf.write(&[PB_START, 0, 0, 0, 3]);
        buf.write(&encode_frame(&sample()));
        assert_eq!(FrameCoder.decode(&mut buf), vec![sample()]);
    }

    #[test]
    pub fn test_max_frame_len() {
        let mut f = sample();
        let fixed = f.frame_len() - f.payload.len();
        f.payload = vec![b'x'; MAX_FRAME_LEN - fixed];
        assert_eq!(f.frame_len(), MAX_FRAME_LEN);
        let mut buf = TcpBuffer::default();
        FrameCoder.encode(&mut f.clone(), &mut buf);
        let frames = FrameCoder.decode(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.len(), f.payload.len());
        assert_eq!(frames[0].msg_id, f.msg_id);
        assert_eq!(buf.readable(), 0);
    }

    #[test]
    pub fn test_over_max_frame_len_skipped() {
        let mut buf = TcpBuffer::default();
        buf.write(&[PB_START]);
        buf.write(&((MAX_FRAME_LEN + 1) as i32).to_be_bytes());
        buf.write(&encode_frame(&sample()));
        assert_eq!(FrameCoder.decode(&mut buf), vec![sample()]);
        assert_eq!(buf.readable(), 0);
    }

    #[test]
    pub fn test_overrun_field() {
        let mut bytes = encode_frame(&sample());
        // msg_id_len larger than the frame.
        bytes[5..9].copy_from_slice(&1000i32.to_be_bytes());
        assert_eq!(parse_frame(&bytes), Err(FrameError::Overrun("msg_id")));
        bytes[5..9].copy_from_slice(&(-1i32).to_be_bytes());
        assert_eq!(parse_frame(&bytes), Err(FrameError::NegativeLen("msg_id")));
    }
}
