//! Response handler chain: classifies a backend HTTP response into a typed
//! MCP content block by Content-Type prefix. Image and audio payloads travel
//! base64-encoded; text is the universal fallback.

use base64::Engine;
use mcp::protocol::Content;

fn mime_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

pub trait ResponseHandler: Send + Sync {
    fn handle(&self, content_type: &str, body: &[u8]) -> Option<Content>;
}

pub struct ImageHandler;

impl ResponseHandler for ImageHandler {
    fn handle(&self, content_type: &str, body: &[u8]) -> Option<Content> {
        let essence = mime_essence(content_type);
        if !essence.starts_with("image/") {
            return None;
        }
        Some(Content::Image {
            data: base64::engine::general_purpose::STANDARD.encode(body),
            mime_type: essence,
        })
    }
}

pub struct AudioHandler;

impl ResponseHandler for AudioHandler {
    fn handle(&self, content_type: &str, body: &[u8]) -> Option<Content> {
        let essence = mime_essence(content_type);
        if !essence.starts_with("audio/") {
            return None;
        }
        Some(Content::Audio {
            data: base64::engine::general_purpose::STANDARD.encode(body),
            mime_type: essence,
        })
    }
}

/// Fallback handler; never rejects on content type.
pub struct TextHandler;

impl ResponseHandler for TextHandler {
    fn handle(&self, _content_type: &str, body: &[u8]) -> Option<Content> {
        Some(Content::Text {
            text: String::from_utf8_lossy(body).into_owned(),
        })
    }
}

pub struct HandlerChain {
    handlers: Vec<Box<dyn ResponseHandler>>,
}

impl Default for HandlerChain {
    fn default() -> Self {
        Self {
            handlers: vec![
                Box::new(ImageHandler),
                Box::new(AudioHandler),
                Box::new(TextHandler),
            ],
        }
    }
}

impl HandlerChain {
    pub fn handle(&self, content_type: &str, body: &[u8]) -> Content {
        for handler in &self.handlers {
            if let Some(content) = handler.handle(content_type, body) {
                return content;
            }
        }
        // TextHandler is in the chain and always matches
        Content::text(String::from_utf8_lossy(body).into_owned())
    }
}
