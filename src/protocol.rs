//! Wire format: length-prefixed frames carrying tag-typed values.
//!
//! Every message is `[len: u32 LE][payload]`. A request payload is an
//! array of strings (the command line); a response payload is always a
//! two-element array of a status integer and one result value. All
//! integers are little-endian.

use thiserror::Error;

use crate::buf::Buf;

/// Hard ceiling on a single message payload.
pub const MAX_MSG: usize = 32 << 20;

/// Value tags.
pub mod tag {
    pub const INT: u8 = 0;
    pub const STR: u8 = 1;
    pub const ARR: u8 = 2;
    pub const NIL: u8 = 3;
    pub const ERR: u8 = 4;
    pub const DBL: u8 = 5;
}

/// Response status, the first element of every response array.
pub mod status {
    pub const OK: u32 = 0;
    pub const ERR: u32 = 1;
    pub const NOT_FOUND: u32 = 2;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("message of {0} bytes exceeds the {MAX_MSG} byte limit")]
    TooLong(usize),
    #[error("malformed request: {0}")]
    Malformed(&'static str),
}

/// Split one complete frame off the front of the incoming buffer.
///
/// `Ok(None)` means more bytes are needed. The frame (header included)
/// is still in the buffer; the caller consumes `4 + payload.len()` once
/// it is done with the borrowed payload.
pub fn peek_frame(incoming: &Buf) -> Result<Option<&[u8]>, FrameError> {
    let Some(header) = incoming.peek(4) else {
        return Ok(None);
    };
    let len = u32::from_le_bytes(header.try_into().unwrap()) as usize;
    if len > MAX_MSG {
        return Err(FrameError::TooLong(len));
    }
    match incoming.peek(4 + len) {
        Some(frame) => Ok(Some(&frame[4..])),
        None => Ok(None),
    }
}

/// Decode a request payload into its command line.
pub fn parse_request(payload: &[u8]) -> Result<Vec<Vec<u8>>, FrameError> {
    let mut cur = payload;
    if take_u8(&mut cur)? != tag::ARR {
        return Err(FrameError::Malformed("request is not an array"));
    }
    let count = take_u32(&mut cur)? as usize;
    if count > payload.len() {
        return Err(FrameError::Malformed("argument count exceeds payload"));
    }
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        if take_u8(&mut cur)? != tag::STR {
            return Err(FrameError::Malformed("argument is not a string"));
        }
        let len = take_u32(&mut cur)? as usize;
        if cur.len() < len {
            return Err(FrameError::Malformed("argument is truncated"));
        }
        let (arg, rest) = cur.split_at(len);
        args.push(arg.to_vec());
        cur = rest;
    }
    if !cur.is_empty() {
        return Err(FrameError::Malformed("trailing bytes after arguments"));
    }
    Ok(args)
}

fn take_u8(cur: &mut &[u8]) -> Result<u8, FrameError> {
    let (&b, rest) = cur
        .split_first()
        .ok_or(FrameError::Malformed("unexpected end of payload"))?;
    *cur = rest;
    Ok(b)
}

fn take_u32(cur: &mut &[u8]) -> Result<u32, FrameError> {
    if cur.len() < 4 {
        return Err(FrameError::Malformed("unexpected end of payload"));
    }
    let (bytes, rest) = cur.split_at(4);
    *cur = rest;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

/// An in-progress response: where its length placeholder and status
/// integer sit in the outgoing buffer.
pub struct Response {
    begin: usize,
    status_pos: usize,
}

/// Open a response frame: length placeholder, then the status element
/// (initially OK). The caller writes exactly one value and closes with
/// [`rsp_end`].
pub fn rsp_begin(out: &mut Buf) -> Response {
    let begin = out.len();
    out.append_u32(0);
    out.append_u8(tag::ARR);
    out.append_u32(2);
    out.append_u8(tag::INT);
    let status_pos = out.len();
    out.append_u32(status::OK);
    Response { begin, status_pos }
}

/// Patch the frame length. An oversized response is thrown away and
/// replaced by an error so the client never sees a frame beyond
/// [`MAX_MSG`].
pub fn rsp_end(out: &mut Buf, rsp: Response) {
    let payload = out.len() - rsp.begin - 4;
    if payload > MAX_MSG {
        out.truncate_to(rsp.begin);
        let retry = rsp_begin(out);
        out_err(out, &retry, "response is too big");
        let payload = out.len() - retry.begin - 4;
        out.patch_u32(retry.begin, payload as u32);
        return;
    }
    out.patch_u32(rsp.begin, payload as u32);
}

/// Integers go out as their low 32 bits, matching the client's reader.
pub fn out_int(out: &mut Buf, v: i64) {
    out.append_u8(tag::INT);
    out.append_u32(v as u32);
}

pub fn out_dbl(out: &mut Buf, v: f64) {
    out.append_u8(tag::DBL);
    out.append_f64(v);
}

pub fn out_str(out: &mut Buf, s: &[u8]) {
    out.append_u8(tag::STR);
    out.append_u32(s.len() as u32);
    out.append(s);
}

pub fn out_nil(out: &mut Buf) {
    out.append_u8(tag::NIL);
}

/// Array of a known element count.
pub fn out_arr(out: &mut Buf, n: u32) {
    out.append_u8(tag::ARR);
    out.append_u32(n);
}

/// Array whose element count is patched in afterwards. Returns the
/// position to hand to [`end_arr`].
pub fn begin_arr(out: &mut Buf) -> usize {
    out.append_u8(tag::ARR);
    let pos = out.len();
    out.append_u32(0);
    pos
}

pub fn end_arr(out: &mut Buf, pos: usize, n: u32) {
    out.patch_u32(pos, n);
}

pub fn out_err(out: &mut Buf, rsp: &Response, msg: &str) {
    out.patch_u32(rsp.status_pos, status::ERR);
    out.append_u8(tag::ERR);
    out.append_u32(msg.len() as u32);
    out.append(msg.as_bytes());
}

/// Status NOT_FOUND with a nil value.
pub fn out_not_found(out: &mut Buf, rsp: &Response) {
    out.patch_u32(rsp.status_pos, status::NOT_FOUND);
    out.append_u8(tag::NIL);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_request(args: &[&[u8]]) -> Vec<u8> {
        let mut payload = vec![tag::ARR];
        payload.extend_from_slice(&(args.len() as u32).to_le_bytes());
        for arg in args {
            payload.push(tag::STR);
            payload.extend_from_slice(&(arg.len() as u32).to_le_bytes());
            payload.extend_from_slice(arg);
        }
        let mut frame = (payload.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(&payload);
        frame
    }

    #[test]
    fn frame_extraction_needs_full_message() {
        let frame = frame_request(&[b"get", b"key"]);
        let mut incoming = Buf::new();
        incoming.append(&frame[..3]);
        assert_eq!(peek_frame(&incoming).unwrap(), None);
        incoming.append(&frame[3..frame.len() - 1]);
        assert_eq!(peek_frame(&incoming).unwrap(), None);
        incoming.append(&frame[frame.len() - 1..]);
        let payload = peek_frame(&incoming).unwrap().unwrap();
        assert_eq!(
            parse_request(payload).unwrap(),
            vec![b"get".to_vec(), b"key".to_vec()]
        );
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut incoming = Buf::new();
        incoming.append(&((MAX_MSG as u32) + 1).to_le_bytes());
        assert_eq!(
            peek_frame(&incoming),
            Err(FrameError::TooLong(MAX_MSG + 1))
        );
    }

    #[test]
    fn malformed_requests_are_rejected() {
        // Wrong outer tag.
        assert!(parse_request(&[tag::STR, 0, 0, 0, 0]).is_err());
        // Count larger than payload could hold.
        let mut p = vec![tag::ARR];
        p.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(parse_request(&p).is_err());
        // Truncated argument.
        let mut p = vec![tag::ARR];
        p.extend_from_slice(&1u32.to_le_bytes());
        p.push(tag::STR);
        p.extend_from_slice(&10u32.to_le_bytes());
        p.extend_from_slice(b"short");
        assert!(parse_request(&p).is_err());
        // Trailing garbage.
        let mut p = vec![tag::ARR];
        p.extend_from_slice(&0u32.to_le_bytes());
        p.push(0xff);
        assert!(parse_request(&p).is_err());
    }

    #[test]
    fn response_layout_and_length_patch() {
        let mut out = Buf::new();
        let rsp = rsp_begin(&mut out);
        out_str(&mut out, b"value");
        rsp_end(&mut out, rsp);

        let data = out.data();
        let len = u32::from_le_bytes(data[..4].try_into().unwrap()) as usize;
        assert_eq!(len, data.len() - 4);
        // array(2), int status OK, then the string.
        assert_eq!(data[4], tag::ARR);
        assert_eq!(&data[5..9], &2u32.to_le_bytes());
        assert_eq!(data[9], tag::INT);
        assert_eq!(&data[10..14], &status::OK.to_le_bytes());
        assert_eq!(data[14], tag::STR);
        assert_eq!(&data[15..19], &5u32.to_le_bytes());
        assert_eq!(&data[19..], b"value");
    }

    #[test]
    fn error_patches_status() {
        let mut out = Buf::new();
        let rsp = rsp_begin(&mut out);
        out_err(&mut out, &rsp, "expect zset");
        rsp_end(&mut out, rsp);

        // Error values are tag, message length, message bytes; no
        // other fields.
        let data = out.data();
        assert_eq!(&data[10..14], &status::ERR.to_le_bytes());
        assert_eq!(data[14], tag::ERR);
        let msg_len = u32::from_le_bytes(data[15..19].try_into().unwrap()) as usize;
        assert_eq!(msg_len, "expect zset".len());
        assert_eq!(&data[19..19 + msg_len], b"expect zset");
        assert_eq!(data.len(), 19 + msg_len);
    }

    #[test]
    fn not_found_patches_status_and_writes_nil() {
        let mut out = Buf::new();
        let rsp = rsp_begin(&mut out);
        out_not_found(&mut out, &rsp);
        rsp_end(&mut out, rsp);
        let data = out.data();
        assert_eq!(&data[10..14], &status::NOT_FOUND.to_le_bytes());
        assert_eq!(data[14], tag::NIL);
    }

    #[test]
    fn negative_ints_wrap_to_u32() {
        let mut out = Buf::new();
        out_int(&mut out, -2);
        assert_eq!(out.data()[0], tag::INT);
        assert_eq!(&out.data()[1..5], &(-2i32 as u32).to_le_bytes());
    }

    #[test]
    fn patched_array_count() {
        let mut out = Buf::new();
        let rsp = rsp_begin(&mut out);
        let pos = begin_arr(&mut out);
        out_int(&mut out, 1);
        out_int(&mut out, 2);
        end_arr(&mut out, pos, 2);
        rsp_end(&mut out, rsp);
        let data = out.data();
        assert_eq!(data[14], tag::ARR);
        assert_eq!(&data[15..19], &2u32.to_le_bytes());
    }
}
