//! Just enough HTTP to account for request/response exchanges.

use smol_str::SmolStr;

use super::Direction;

#[derive(Debug, Default)]
pub struct HttpParser {
    pub method: Option<SmolStr>,
    pub url: Option<String>,
    pub status_code: Option<u16>,
    pub exchanges: u32,
    pub peer_closed: bool,
}

impl HttpParser {
    pub(crate) fn parse(&mut self, dir: Direction, data: &[u8]) {
        if dir == Direction::Close {
            self.peer_closed = true;
            return;
        }

        if data.starts_with(b"HTTP/") {
            self.parse_status_line(data);
        } else {
            self.parse_request_line(data);
        }
    }

    /// "METHOD SP url SP HTTP/x.y"; only the first request line is kept.
    fn parse_request_line(&mut self, data: &[u8]) {
        let line = match data.iter().position(|b| *b == b'\r' || *b == b'\n') {
            Some(end) => &data[..end],
            None => data,
        };

        let mut fields = line.split(|b| *b == b' ').filter(|f| !f.is_empty());
        let (Some(method), Some(url), Some(version)) = (fields.next(), fields.next(), fields.next())
        else {
            return;
        };

        if !version.starts_with(b"HTTP/") || self.method.is_some() {
            return;
        }

        if let (Ok(method), Ok(url)) = (std::str::from_utf8(method), std::str::from_utf8(url)) {
            self.method = Some(SmolStr::new(method));
            self.url = Some(url.to_owned());
        }
    }

    /// "HTTP/x.y SP status SP reason"; each status line closes an exchange.
    fn parse_status_line(&mut self, data: &[u8]) {
        let mut fields = data.split(|b| *b == b' ').filter(|f| !f.is_empty());
        let _version = fields.next();

        let Some(code) = fields.next() else { return };
        if let Ok(code) = std::str::from_utf8(code) {
            if let Ok(code) = code.parse::<u16>() {
                self.status_code = Some(code);
                self.exchanges += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_is_captured_once() {
        let mut parser = HttpParser::default();

        parser.parse(Direction::In, b"GET /index.html HTTP/1.1\r\nHost: x\r\n");
        parser.parse(Direction::In, b"POST /other HTTP/1.1\r\n");

        assert_eq!(parser.method.as_deref(), Some("GET"));
        assert_eq!(parser.url.as_deref(), Some("/index.html"));
    }

    #[test]
    fn status_line_records_the_code_and_counts_an_exchange() {
        let mut parser = HttpParser::default();

        parser.parse(Direction::Out, b"HTTP/1.1 404 Not Found\r\n");

        assert_eq!(parser.status_code, Some(404));
        assert_eq!(parser.exchanges, 1);
    }

    #[test]
    fn close_marks_the_parser() {
        let mut parser = HttpParser::default();

        parser.parse(Direction::Close, &[]);

        assert!(parser.peer_closed);
    }

    #[test]
    fn garbage_is_ignored() {
        let mut parser = HttpParser::default();

        parser.parse(Direction::In, b"\x00\x01\x02");

        assert!(parser.method.is_none());
        assert!(parser.status_code.is_none());
    }
}
