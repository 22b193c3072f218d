//! Error page bank
//!
//! Pages are rendered once at start-up from an HTML template with two
//! placeholders, `{{code}}` and `{{info-lines}}`, and then served as fixed
//! byte blobs keyed by code. Codes 601-606 are edge-internal and map onto a
//! regular HTTP status.

use std::collections::HashMap;
use std::path::Path;

use hyper::body::Bytes;
use hyper::{header, Body, Response, StatusCode};
use tracing::{debug, info};

/// Record-store lookup failed
pub const DNS_FAILURE: u16 = 601;
/// No upstream target in the routing context
pub const TARGET_UNSET: u16 = 602;
/// Could not connect to the origin
pub const BACKEND_CONNECT: u16 = 603;
/// Host is not served here
pub const NO_RECORD: u16 = 604;
/// Origin did not answer in time
pub const BACKEND_TIMEOUT: u16 = 605;
/// Handler panicked
pub const HANDLER_PANIC: u16 = 606;
pub const FORBIDDEN: u16 = 403;

const DEFAULT_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"><title>Error {{code}}</title></head>
<body>
<h1>{{code}}</h1>
{{info-lines}}
</body>
</html>
"#;

/// `(code, status, title, message lines)`
const PAGES: &[(u16, u16, &str, &[&str])] = &[
    (403, 403, "Forbidden", &["This request was blocked by the edge firewall."]),
    (404, 404, "Not Found", &["The requested resource does not exist."]),
    (500, 500, "Internal Server Error", &["Something went wrong on the edge."]),
    (502, 502, "Bad Gateway", &["The origin returned an invalid response."]),
    (504, 504, "Gateway Timeout", &["The origin did not respond in time."]),
    (
        DNS_FAILURE,
        500,
        "DNS Resolution Failed",
        &["The edge could not look up the records for this host."],
    ),
    (
        TARGET_UNSET,
        500,
        "Routing Error",
        &["No origin is configured for this request."],
    ),
    (
        BACKEND_CONNECT,
        502,
        "Origin Unreachable",
        &["The edge could not connect to the origin server.", "Please try again later."],
    ),
    (
        NO_RECORD,
        404,
        "Unknown Host",
        &["This host is not served by this edge network."],
    ),
    (
        BACKEND_TIMEOUT,
        504,
        "Origin Timeout",
        &["The origin server took too long to respond.", "Please try again later."],
    ),
    (
        HANDLER_PANIC,
        500,
        "Internal Error",
        &["The edge hit an unexpected error while handling this request."],
    ),
];

#[derive(Debug, Clone)]
struct Page {
    status: StatusCode,
    body: Bytes,
}

/// Rendered pages by code
#[derive(Debug, Clone)]
pub struct ErrorPages {
    pages: HashMap<u16, Page>,
}

impl Default for ErrorPages {
    fn default() -> Self {
        Self::render(DEFAULT_TEMPLATE)
    }
}

impl ErrorPages {
    /// Render every known code into `template`
    pub fn render(template: &str) -> Self {
        let pages = PAGES
            .iter()
            .map(|(code, status, title, lines)| {
                let mut info = format!("<h2>{}</h2>", escape(title));
                for line in lines.iter() {
                    info.push_str("\n<p>");
                    info.push_str(&escape(line));
                    info.push_str("</p>");
                }
                let html = template
                    .replace("{{code}}", &code.to_string())
                    .replace("{{info-lines}}", &info);
                let status =
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                (*code, Page { status, body: Bytes::from(html) })
            })
            .collect();
        Self { pages }
    }

    /// Render from `<public_dir>/error.html`, or the built-in template when
    /// the file is absent
    pub fn load(public_dir: Option<&Path>) -> std::io::Result<Self> {
        let Some(dir) = public_dir else {
            return Ok(Self::default());
        };
        let path = dir.join("error.html");
        match std::fs::read_to_string(&path) {
            Ok(template) => {
                info!("Rendering error pages from {}", path.display());
                Ok(Self::render(&template))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} not found, using built-in error template", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    /// HTTP status for `code`; unknown codes are 500
    pub fn status(&self, code: u16) -> StatusCode {
        self.pages
            .get(&code)
            .map(|p| p.status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn body(&self, code: u16) -> Option<Bytes> {
        self.pages.get(&code).map(|p| p.body.clone())
    }

    pub fn response(&self, code: u16) -> Response<Body> {
        let page = self
            .pages
            .get(&code)
            .or_else(|| self.pages.get(&500))
            .cloned()
            .unwrap_or(Page {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: Bytes::new(),
            });

        let mut response = Response::new(Body::from(page.body));
        *response.status_mut() = page.status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/html; charset=utf-8"),
        );
        response
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
