// Parsing of ErrorResponse / NoticeResponse field lists.

use crate::errors::Error;

/// The interesting fields of a PostgreSQL error or notice message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PgErrorMsg {
    pub severity: String,
    pub code: String,
    pub message: String,
}

impl PgErrorMsg {
    /// Parse the body of an 'E' or 'N' message (the bytes after the length
    /// field): a sequence of single-byte field tags followed by
    /// NUL-terminated values, ending with a zero byte.
    pub fn parse(body: &[u8]) -> Result<PgErrorMsg, Error> {
        let mut result = PgErrorMsg::default();
        let mut cursor = 0usize;

        while cursor < body.len() {
            let tag = body[cursor];
            if tag == 0 {
                break;
            }
            cursor += 1;

            let start = cursor;
            while cursor < body.len() && body[cursor] != 0 {
                cursor += 1;
            }
            if cursor >= body.len() {
                return Err(Error::ProtocolSyncError(
                    "error message field is not NUL-terminated".into(),
                ));
            }
            let value = String::from_utf8_lossy(&body[start..cursor]).to_string();
            cursor += 1;

            match tag {
                b'S' => result.severity = value,
                b'C' => result.code = value,
                b'M' => result.message = value,
                _ => (),
            }
        }

        if result.message.is_empty() && result.code.is_empty() {
            return Err(Error::ProtocolSyncError(
                "error message carries no code and no message".into(),
            ));
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_severity_code_and_message() {
        let mut body = Vec::new();
        body.extend_from_slice(b"SFATAL\0");
        body.extend_from_slice(b"C28000\0");
        body.extend_from_slice(b"Mrole does not exist\0");
        body.push(0);

        let parsed = PgErrorMsg::parse(&body).unwrap();
        assert_eq!(parsed.severity, "FATAL");
        assert_eq!(parsed.code, "28000");
        assert_eq!(parsed.message, "role does not exist");
    }

    #[test]
    fn ignores_unknown_fields() {
        let mut body = Vec::new();
        body.extend_from_slice(b"SERROR\0");
        body.extend_from_slice(b"Fpostgres.c\0");
        body.extend_from_slice(b"C57014\0");
        body.extend_from_slice(b"Mcanceling statement due to user request\0");
        body.push(0);

        let parsed = PgErrorMsg::parse(&body).unwrap();
        assert_eq!(parsed.code, "57014");
        assert_eq!(parsed.message, "canceling statement due to user request");
    }

    #[test]
    fn empty_body_is_rejected() {
        assert!(PgErrorMsg::parse(&[0]).is_err());
    }
}
