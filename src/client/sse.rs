//! Incremental parser for the `text/event-stream` format.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    /// `None` for the default `message` event.
    pub event: Option<String>,
    pub data: String,
}

impl SseMessage {
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

#[derive(Debug, Default)]
pub struct SseParser {
    line: Vec<u8>,
    event: Option<String>,
    data: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw body bytes and returns every event completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        let mut messages = Vec::new();
        for &byte in chunk {
            if byte != b'\n' {
                self.line.push(byte);
                continue;
            }
            let mut line = std::mem::take(&mut self.line);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(message) = self.process_line(&String::from_utf8_lossy(&line)) {
                messages.push(message);
            }
        }
        messages
    }

    fn process_line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => match self.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        let event = self.event.take();
        let data = self.data.take()?;
        Some(SseMessage { event, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_events_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: {\"stream\":\"std").is_empty());
        let messages = parser.push(b"out\",\"text\":\"hi\"}\n\ndata: [DONE]\n\n");

        assert_eq!(
            messages,
            vec![
                SseMessage {
                    event: None,
                    data: r#"{"stream":"stdout","text":"hi"}"#.to_string()
                },
                SseMessage {
                    event: None,
                    data: "[DONE]".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_comments_and_named_events() {
        let mut parser = SseParser::new();
        let messages = parser.push(b":\n\nevent: error\r\ndata: {}\r\n\r\n");

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].event.as_deref(), Some("error"));
        assert!(!messages[0].is_message());
    }

    #[test]
    fn test_multiline_data_is_joined() {
        let mut parser = SseParser::new();
        let messages = parser.push(b"data:a\ndata: b\n\n");
        assert_eq!(messages[0].data, "a\nb");
        assert!(messages[0].is_message());
    }
}
