use nom::{
    bytes::complete::take_while_m_n,
    character::complete::one_of,
    combinator::{map_res, opt},
    IResult,
};

/// What a reply code means for the command that triggered it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyKind {
    PositivePreliminary,
    PositiveCompletion,
    PositiveIntermediate,
    TransientNegative,
    PermanentNegative,
}

/// One parsed line of a (possibly multiline) SMTP reply.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplyLine<'a> {
    pub code: u16,
    /// `true` when this is the final line (separator was a space or the
    /// line was just the code).
    pub last: bool,
    pub text: &'a str,
}

impl ReplyLine<'_> {
    pub fn kind(&self) -> ReplyKind {
        match self.code / 100 {
            1 => ReplyKind::PositivePreliminary,
            2 => ReplyKind::PositiveCompletion,
            3 => ReplyKind::PositiveIntermediate,
            4 => ReplyKind::TransientNegative,
            _ => ReplyKind::PermanentNegative,
        }
    }
}

fn code(input: &str) -> IResult<&str, u16> {
    map_res(
        take_while_m_n(3, 3, |c: char| c.is_ascii_digit()),
        |s: &str| s.parse::<u16>(),
    )(input)
}

fn reply_line(input: &str) -> IResult<&str, ReplyLine> {
    let (rest, code) = code(input)?;
    let (rest, sep) = opt(one_of(" -"))(rest)?;
    if sep.is_none() && !rest.is_empty() {
        return Err(nom::Err::Error(nom::error::Error::new(
            rest,
            nom::error::ErrorKind::Char,
        )));
    }
    Ok((
        "",
        ReplyLine {
            code,
            last: sep != Some('-'),
            text: rest,
        },
    ))
}

/// Parse one reply line (CRLF already stripped). The code must be three
/// digits in 200..=599 followed by a space, a dash, or end of line.
pub fn parse_reply_line(line: &[u8]) -> Option<ReplyLine> {
    let line = std::str::from_utf8(line).ok()?;
    let (_, reply) = reply_line(line).ok()?;
    if reply.code < 200 || reply.code > 599 {
        return None;
    }
    Some(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_final_and_continuation() {
        let r = parse_reply_line(b"250 ok").unwrap();
        assert_eq!((r.code, r.last, r.text), (250, true, "ok"));
        assert_eq!(r.kind(), ReplyKind::PositiveCompletion);

        let r = parse_reply_line(b"250-PIPELINING").unwrap();
        assert_eq!((r.code, r.last, r.text), (250, false, "PIPELINING"));

        let r = parse_reply_line(b"354").unwrap();
        assert!(r.last);
        assert_eq!(r.kind(), ReplyKind::PositiveIntermediate);

        let r = parse_reply_line(b"451 try later").unwrap();
        assert_eq!(r.kind(), ReplyKind::TransientNegative);
        let r = parse_reply_line(b"550 no").unwrap();
        assert_eq!(r.kind(), ReplyKind::PermanentNegative);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_reply_line(b"ok").is_none());
        assert!(parse_reply_line(b"25").is_none());
        assert!(parse_reply_line(b"199 nope").is_none());
        assert!(parse_reply_line(b"600 nope").is_none());
        assert!(parse_reply_line(b"2500").is_none());
        assert!(parse_reply_line(b"\xff\xfe\xfd").is_none());
    }
}
