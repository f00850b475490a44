//! Incremental NATS protocol parser
//!
//! A resumable byte-at-a-time state machine over the server → client
//! operations:
//!
//! ```text
//! INFO {json}\r\n
//! MSG <subject> <sid> [reply] <#bytes>\r\n<payload>\r\n
//! HMSG <subject> <sid> [reply] <#hdr> <#total>\r\n<headers><payload>\r\n
//! PING\r\n | PONG\r\n | +OK\r\n | -ERR <text>\r\n
//! ```
//!
//! Operation names are case-insensitive. Input may be split at any byte
//! boundary; partial control lines and payloads are carried over to the
//! next [`Parser::parse`] call. A payload that arrives whole inside one
//! buffer is handed to the handler without copying.
//!
//! Any byte that is not a valid transition is a fatal protocol error. The
//! parser must then be [`reset`](Parser::reset) together with the socket.

use smallvec::SmallVec;
use tracing::trace;

use crate::constants::buffer;
use crate::error::{NatsError, Result};

/// Receiver for fully framed protocol operations
pub trait ProtocolHandler {
    /// `INFO` with its raw JSON argument
    fn process_info(&mut self, info: &[u8]) -> Result<()>;

    /// `MSG` or `HMSG` with its payload (headers included for `HMSG`)
    fn process_msg(&mut self, args: &MsgArgs<'_>, payload: &[u8]) -> Result<()>;

    fn process_ping(&mut self) -> Result<()>;

    fn process_pong(&mut self) -> Result<()>;

    fn process_ok(&mut self) -> Result<()>;

    /// `-ERR` with its description (quotes preserved)
    fn process_err(&mut self, text: &str) -> Result<()>;
}

/// Arguments of a `MSG`/`HMSG` line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgArgs<'a> {
    pub subject: &'a str,
    pub sid: u64,
    pub reply: Option<&'a str>,
    /// Header block length, 0 for `MSG`
    pub header_len: usize,
    /// Total payload length including headers
    pub total_len: usize,
}

/// Positions of the parsed arguments inside the argument buffer
#[derive(Debug, Clone, Copy, Default)]
struct ArgSpans {
    subject: (usize, usize),
    reply: Option<(usize, usize)>,
    sid: u64,
    header_len: usize,
    total_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    OpStart,
    OpPlus,
    OpPlusO,
    OpPlusOk,
    OpMinus,
    OpMinusE,
    OpMinusEr,
    OpMinusErr,
    OpMinusErrSpc,
    MinusErrArg,
    OpH,
    OpM,
    OpMs,
    OpMsg,
    OpMsgSpc,
    MsgArg,
    MsgPayload,
    MsgEnd,
    OpP,
    OpPi,
    OpPin,
    OpPing,
    OpPo,
    OpPon,
    OpPong,
    OpI,
    OpIn,
    OpInf,
    OpInfo,
    OpInfoSpc,
    InfoArg,
}

/// Resumable protocol parser
#[derive(Debug)]
pub struct Parser {
    state: State,
    /// Control line argument bytes (MSG args, INFO json, -ERR text)
    arg_buf: Vec<u8>,
    /// Payload bytes when a message spans reads
    msg_buf: Vec<u8>,
    args: ArgSpans,
    is_hmsg: bool,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
const fn is_space(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

impl Parser {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::OpStart,
            arg_buf: Vec::with_capacity(buffer::PARSER_ARG),
            msg_buf: Vec::new(),
            args: ArgSpans::default(),
            is_hmsg: false,
        }
    }

    /// Return to line-start, discarding any partial operation
    pub fn reset(&mut self) {
        self.state = State::OpStart;
        self.arg_buf.clear();
        self.msg_buf.clear();
        self.is_hmsg = false;
    }

    /// Check if the parser is between operations
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == State::OpStart
    }

    /// Feed a chunk of bytes, dispatching every operation it completes
    pub fn parse<H: ProtocolHandler + ?Sized>(&mut self, buf: &[u8], handler: &mut H) -> Result<()> {
        let mut i = 0;
        while i < buf.len() {
            if self.state == State::MsgPayload {
                i += self.consume_payload(&buf[i..], handler)?;
                continue;
            }

            let b = buf[i];
            let upper = b.to_ascii_uppercase();
            self.state = match self.state {
                State::OpStart => match upper {
                    b'M' => {
                        self.is_hmsg = false;
                        State::OpM
                    }
                    b'H' => State::OpH,
                    b'P' => State::OpP,
                    b'+' => State::OpPlus,
                    b'-' => State::OpMinus,
                    b'I' => State::OpI,
                    _ => return Err(self.fail(buf, i)),
                },

                State::OpH => match upper {
                    b'M' => {
                        self.is_hmsg = true;
                        State::OpM
                    }
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpM => match upper {
                    b'S' => State::OpMs,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpMs => match upper {
                    b'G' => State::OpMsg,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpMsg => match b {
                    b' ' | b'\t' => State::OpMsgSpc,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpMsgSpc => {
                    if is_space(b) {
                        State::OpMsgSpc
                    } else {
                        self.arg_buf.clear();
                        self.arg_buf.push(b);
                        State::MsgArg
                    }
                }
                State::MsgArg => match b {
                    b'\r' => State::MsgArg,
                    b'\n' => {
                        self.args = self.parse_msg_args()?;
                        self.msg_buf.clear();
                        if self.args.total_len == 0 {
                            self.dispatch_msg(&[], handler)?;
                            State::MsgEnd
                        } else {
                            State::MsgPayload
                        }
                    }
                    _ => {
                        self.arg_buf.push(b);
                        State::MsgArg
                    }
                },
                State::MsgPayload => unreachable!("payload bytes are consumed in bulk"),
                State::MsgEnd => match b {
                    b'\r' => State::MsgEnd,
                    b'\n' => State::OpStart,
                    _ => return Err(self.fail(buf, i)),
                },

                State::OpP => match upper {
                    b'I' => State::OpPi,
                    b'O' => State::OpPo,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpPi => match upper {
                    b'N' => State::OpPin,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpPin => match upper {
                    b'G' => State::OpPing,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpPing => match b {
                    b'\n' => {
                        handler.process_ping()?;
                        State::OpStart
                    }
                    b'\r' | b' ' | b'\t' => State::OpPing,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpPo => match upper {
                    b'N' => State::OpPon,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpPon => match upper {
                    b'G' => State::OpPong,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpPong => match b {
                    b'\n' => {
                        handler.process_pong()?;
                        State::OpStart
                    }
                    b'\r' | b' ' | b'\t' => State::OpPong,
                    _ => return Err(self.fail(buf, i)),
                },

                State::OpPlus => match upper {
                    b'O' => State::OpPlusO,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpPlusO => match upper {
                    b'K' => State::OpPlusOk,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpPlusOk => match b {
                    b'\n' => {
                        handler.process_ok()?;
                        State::OpStart
                    }
                    b'\r' => State::OpPlusOk,
                    _ => return Err(self.fail(buf, i)),
                },

                State::OpMinus => match upper {
                    b'E' => State::OpMinusE,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpMinusE => match upper {
                    b'R' => State::OpMinusEr,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpMinusEr => match upper {
                    b'R' => State::OpMinusErr,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpMinusErr => match b {
                    b' ' | b'\t' => State::OpMinusErrSpc,
                    b'\r' => State::OpMinusErr,
                    b'\n' => {
                        handler.process_err("")?;
                        State::OpStart
                    }
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpMinusErrSpc => match b {
                    b' ' | b'\t' | b'\r' => State::OpMinusErrSpc,
                    b'\n' => {
                        handler.process_err("")?;
                        State::OpStart
                    }
                    _ => {
                        self.arg_buf.clear();
                        self.arg_buf.push(b);
                        State::MinusErrArg
                    }
                },
                State::MinusErrArg => match b {
                    b'\r' => State::MinusErrArg,
                    b'\n' => {
                        let text = String::from_utf8_lossy(&self.arg_buf);
                        handler.process_err(&text)?;
                        State::OpStart
                    }
                    _ => {
                        self.arg_buf.push(b);
                        State::MinusErrArg
                    }
                },

                State::OpI => match upper {
                    b'N' => State::OpIn,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpIn => match upper {
                    b'F' => State::OpInf,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpInf => match upper {
                    b'O' => State::OpInfo,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpInfo => match b {
                    b' ' | b'\t' => State::OpInfoSpc,
                    _ => return Err(self.fail(buf, i)),
                },
                State::OpInfoSpc => {
                    if is_space(b) {
                        State::OpInfoSpc
                    } else {
                        self.arg_buf.clear();
                        self.arg_buf.push(b);
                        State::InfoArg
                    }
                }
                State::InfoArg => match b {
                    b'\r' => State::InfoArg,
                    b'\n' => {
                        handler.process_info(&self.arg_buf)?;
                        State::OpStart
                    }
                    _ => {
                        self.arg_buf.push(b);
                        State::InfoArg
                    }
                },
            };
            i += 1;
        }
        Ok(())
    }

    /// Consume payload bytes from `input`, returning how many were used
    fn consume_payload<H: ProtocolHandler + ?Sized>(
        &mut self,
        input: &[u8],
        handler: &mut H,
    ) -> Result<usize> {
        let size = self.args.total_len;

        // Whole payload in this buffer: hand it over without copying
        if self.msg_buf.is_empty() && input.len() >= size {
            self.dispatch_msg(&input[..size], handler)?;
            self.state = State::MsgEnd;
            return Ok(size);
        }

        if self.msg_buf.capacity() < size {
            self.msg_buf.reserve(size - self.msg_buf.len());
        }
        let needed = size - self.msg_buf.len();
        let take = needed.min(input.len());
        self.msg_buf.extend_from_slice(&input[..take]);

        if self.msg_buf.len() == size {
            let result = self.dispatch_msg(&self.msg_buf, handler);
            self.msg_buf.clear();
            result?;
            self.state = State::MsgEnd;
        }
        Ok(take)
    }

    fn dispatch_msg<H: ProtocolHandler + ?Sized>(&self, payload: &[u8], handler: &mut H) -> Result<()> {
        let line = std::str::from_utf8(&self.arg_buf)
            .map_err(|_| NatsError::protocol("message arguments are not UTF-8"))?;
        let spans = &self.args;
        let args = MsgArgs {
            subject: &line[spans.subject.0..spans.subject.1],
            sid: spans.sid,
            reply: spans.reply.map(|(s, e)| &line[s..e]),
            header_len: spans.header_len,
            total_len: spans.total_len,
        };
        trace!(
            "Dispatching {} sid={} subject={} size={}",
            if self.is_hmsg { "HMSG" } else { "MSG" },
            args.sid,
            args.subject,
            payload.len()
        );
        handler.process_msg(&args, payload)
    }

    fn parse_msg_args(&self) -> Result<ArgSpans> {
        let line = &self.arg_buf;
        if std::str::from_utf8(line).is_err() {
            return Err(NatsError::protocol("message arguments are not UTF-8"));
        }

        let mut tokens: SmallVec<[(usize, usize); 6]> = SmallVec::new();
        let mut start = None;
        for (idx, &b) in line.iter().enumerate() {
            match (is_space(b), start) {
                (true, Some(s)) => {
                    tokens.push((s, idx));
                    start = None;
                }
                (false, None) => start = Some(idx),
                _ => {}
            }
        }
        if let Some(s) = start {
            tokens.push((s, line.len()));
        }

        let bad_args = || {
            NatsError::protocol(format!(
                "malformed {} arguments: {:?}",
                if self.is_hmsg { "HMSG" } else { "MSG" },
                String::from_utf8_lossy(line)
            ))
        };
        let num = |(s, e): (usize, usize)| parse_size(&line[s..e]).ok_or_else(bad_args);

        let (reply, header_len, total_len) = match (self.is_hmsg, tokens.len()) {
            (false, 3) => (None, 0, num(tokens[2])?),
            (false, 4) => (Some(tokens[2]), 0, num(tokens[3])?),
            (true, 4) => (None, num(tokens[2])?, num(tokens[3])?),
            (true, 5) => (Some(tokens[2]), num(tokens[3])?, num(tokens[4])?),
            _ => return Err(bad_args()),
        };

        if header_len > total_len {
            return Err(bad_args());
        }
        if total_len > buffer::MSG_MAX {
            return Err(NatsError::protocol(format!(
                "message size {} exceeds the {} byte limit",
                total_len,
                buffer::MSG_MAX
            )));
        }

        Ok(ArgSpans {
            subject: tokens[0],
            reply,
            sid: num(tokens[1])? as u64,
            header_len,
            total_len,
        })
    }

    fn fail(&self, buf: &[u8], at: usize) -> NatsError {
        let end = (at + 32).min(buf.len());
        NatsError::protocol(format!(
            "parse error [{:?}]: {:?}",
            self.state,
            String::from_utf8_lossy(&buf[at..end])
        ))
    }
}

/// Parse an unsigned decimal, rejecting signs, empty input and overflow
#[inline]
#[must_use]
pub fn parse_size(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() {
        return None;
    }
    let mut n: usize = 0;
    for &d in digits {
        if !d.is_ascii_digit() {
            return None;
        }
        n = n.checked_mul(10)?.checked_add(usize::from(d - b'0'))?;
    }
    Some(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        Info(String),
        Msg {
            subject: String,
            sid: u64,
            reply: Option<String>,
            header_len: usize,
            payload: Vec<u8>,
        },
        Ping,
        Pong,
        Ok,
        Err(String),
    }

    #[derive(Default)]
    struct Recorder(Vec<Op>);

    impl ProtocolHandler for Recorder {
        fn process_info(&mut self, info: &[u8]) -> Result<()> {
            self.0.push(Op::Info(String::from_utf8_lossy(info).into_owned()));
            Ok(())
        }
        fn process_msg(&mut self, args: &MsgArgs<'_>, payload: &[u8]) -> Result<()> {
            self.0.push(Op::Msg {
                subject: args.subject.to_string(),
                sid: args.sid,
                reply: args.reply.map(str::to_string),
                header_len: args.header_len,
                payload: payload.to_vec(),
            });
            Ok(())
        }
        fn process_ping(&mut self) -> Result<()> {
            self.0.push(Op::Ping);
            Ok(())
        }
        fn process_pong(&mut self) -> Result<()> {
            self.0.push(Op::Pong);
            Ok(())
        }
        fn process_ok(&mut self) -> Result<()> {
            self.0.push(Op::Ok);
            Ok(())
        }
        fn process_err(&mut self, text: &str) -> Result<()> {
            self.0.push(Op::Err(text.to_string()));
            Ok(())
        }
    }

    fn parse_all(input: &[u8]) -> Result<Vec<Op>> {
        let mut parser = Parser::new();
        let mut rec = Recorder::default();
        parser.parse(input, &mut rec)?;
        Ok(rec.0)
    }

    #[test]
    fn test_control_ops() {
        let ops = parse_all(b"PING\r\nPONG\r\n+OK\r\n-ERR 'Unknown Subject'\r\n").unwrap();
        assert_eq!(ops, vec![
            Op::Ping,
            Op::Pong,
            Op::Ok,
            Op::Err("'Unknown Subject'".into())
        ]);
    }

    #[test]
    fn test_case_insensitive() {
        let ops = parse_all(b"ping\r\nPoNg\r\n+ok\r\nmsg foo 1 2\r\nhi\r\n").unwrap();
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[3], Op::Msg {
            subject: "foo".into(),
            sid: 1,
            reply: None,
            header_len: 0,
            payload: b"hi".to_vec(),
        });
    }

    #[test]
    fn test_info() {
        let ops = parse_all(b"INFO {\"server_id\":\"abc\"}\r\n").unwrap();
        assert_eq!(ops, vec![Op::Info("{\"server_id\":\"abc\"}".into())]);
    }

    #[test]
    fn test_msg_with_reply() {
        let ops = parse_all(b"MSG foo.bar 9 _INBOX.x 5\r\nhello\r\n").unwrap();
        assert_eq!(ops, vec![Op::Msg {
            subject: "foo.bar".into(),
            sid: 9,
            reply: Some("_INBOX.x".into()),
            header_len: 0,
            payload: b"hello".to_vec(),
        }]);
    }

    #[test]
    fn test_hmsg() {
        let hdr = b"NATS/1.0\r\nA: b\r\n\r\n";
        let mut input = format!("HMSG foo 3 {} {}\r\n", hdr.len(), hdr.len() + 2).into_bytes();
        input.extend_from_slice(hdr);
        input.extend_from_slice(b"ok\r\n");

        let ops = parse_all(&input).unwrap();
        match &ops[0] {
            Op::Msg {
                header_len,
                payload,
                ..
            } => {
                assert_eq!(*header_len, hdr.len());
                assert_eq!(&payload[hdr.len()..], b"ok");
            }
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn test_zero_length_payload() {
        let ops = parse_all(b"MSG foo 1 0\r\n\r\nPING\r\n").unwrap();
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], Op::Msg { payload, .. } if payload.is_empty()));
        assert_eq!(ops[1], Op::Ping);
    }

    #[test]
    fn test_payload_containing_crlf() {
        let ops = parse_all(b"MSG foo 1 6\r\na\r\nb\r\n\r\n").unwrap();
        assert!(matches!(&ops[0], Op::Msg { payload, .. } if payload == b"a\r\nb\r\n"));
    }

    #[test]
    fn test_one_byte_at_a_time() {
        let input = b"INFO {}\r\nMSG foo 1 _R 3\r\nabc\r\n-ERR 'x'\r\nPING\r\n";
        let mut parser = Parser::new();
        let mut rec = Recorder::default();
        for b in input.iter() {
            parser.parse(std::slice::from_ref(b), &mut rec).unwrap();
        }
        assert_eq!(rec.0, parse_all(input).unwrap());
        assert!(parser.is_idle());
    }

    #[test]
    fn test_payload_split_across_reads() {
        let input = b"MSG foo 1 10\r\n0123456789\r\n";
        let header_len = 14;
        for cut in [header_len, header_len + 1, header_len + 9, header_len + 10, header_len + 11] {
            let mut parser = Parser::new();
            let mut rec = Recorder::default();
            parser.parse(&input[..cut], &mut rec).unwrap();
            parser.parse(&input[cut..], &mut rec).unwrap();
            assert_eq!(rec.0.len(), 1, "cut at {cut}");
            assert!(matches!(&rec.0[0], Op::Msg { payload, .. } if payload == b"0123456789"));
        }
    }

    #[test]
    fn test_unknown_op_is_fatal() {
        let err = parse_all(b"XYZ\r\n").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_negative_size_is_fatal() {
        assert!(parse_all(b"MSG foo 1 -5\r\n").unwrap_err().is_fatal());
    }

    #[test]
    fn test_wrong_arg_count_is_fatal() {
        assert!(parse_all(b"MSG foo\r\n").is_err());
        assert!(parse_all(b"MSG a b c d e f\r\n").is_err());
        assert!(parse_all(b"HMSG foo 1 2\r\n").is_err());
    }

    #[test]
    fn test_header_len_exceeding_total_is_fatal() {
        assert!(parse_all(b"HMSG foo 1 10 5\r\n").is_err());
    }

    #[test]
    fn test_oversized_message_is_fatal() {
        let err = parse_all(b"MSG a 1 18446744073709551615\r\n").unwrap_err();
        assert!(err.is_fatal());
        let err = parse_all(b"HMSG a 1 10 99999999999\r\n").unwrap_err();
        assert!(err.is_fatal());

        let mut parser = Parser::new();
        let at_limit = format!("MSG a 1 {}\r\n", buffer::MSG_MAX);
        assert!(parser.parse(at_limit.as_bytes(), &mut Recorder::default()).is_ok());
    }

    #[test]
    fn test_missing_trailing_crlf_is_fatal() {
        assert!(parse_all(b"MSG foo 1 2\r\nhiXX").is_err());
    }

    #[test]
    fn test_reset_discards_partial() {
        let mut parser = Parser::new();
        let mut rec = Recorder::default();
        parser.parse(b"MSG foo 1 10\r\n012", &mut rec).unwrap();
        parser.reset();
        parser.parse(b"PONG\r\n", &mut rec).unwrap();
        assert_eq!(rec.0, vec![Op::Pong]);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size(b"0"), Some(0));
        assert_eq!(parse_size(b"1234"), Some(1234));
        assert_eq!(parse_size(b""), None);
        assert_eq!(parse_size(b"-1"), None);
        assert_eq!(parse_size(b"12a"), None);
        assert_eq!(parse_size(b"99999999999999999999999999"), None);
    }
}
