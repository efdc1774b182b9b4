// SIP 消息解析和生成
// 支持 GB28181 标准的 SIP 消息格式

use crate::error::{Result, SipError};
use crate::header::{canonical_name, CSeq, Headers, NameAddr, ViaHop};
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;

pub const SIP_VERSION: &str = "SIP/2.0";

/// SIP 方法
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    Message,
    Subscribe,
    Notify,
    Info,
    Options,
    /// 未识别的方法，保留原始 token，由分发层回复 405
    Other(String),
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Register => write!(f, "REGISTER"),
            Method::Invite => write!(f, "INVITE"),
            Method::Ack => write!(f, "ACK"),
            Method::Bye => write!(f, "BYE"),
            Method::Cancel => write!(f, "CANCEL"),
            Method::Message => write!(f, "MESSAGE"),
            Method::Subscribe => write!(f, "SUBSCRIBE"),
            Method::Notify => write!(f, "NOTIFY"),
            Method::Info => write!(f, "INFO"),
            Method::Options => write!(f, "OPTIONS"),
            Method::Other(token) => write!(f, "{}", token),
        }
    }
}

impl Method {
    pub fn from_token(s: &str) -> Self {
        match s {
            "REGISTER" => Method::Register,
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "MESSAGE" => Method::Message,
            "SUBSCRIBE" => Method::Subscribe,
            "NOTIFY" => Method::Notify,
            "INFO" => Method::Info,
            "OPTIONS" => Method::Options,
            other => Method::Other(other.to_string()),
        }
    }
}

/// 标准状态码对应的原因短语
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "",
    }
}

/// 请求与响应共享的头部访问
pub trait SipHeaders {
    fn headers(&self) -> &Headers;

    fn headers_mut(&mut self) -> &mut Headers;

    /// 最顶层的 Via 跳（多个 hop 写在同一行时取第一个）
    fn via_hop(&self) -> Option<ViaHop> {
        let raw = self.headers().get("Via")?;
        raw.split(',').next()?.parse().ok()
    }

    fn from_header(&self) -> Option<NameAddr> {
        self.headers().get("From")?.parse().ok()
    }

    fn to_header(&self) -> Option<NameAddr> {
        self.headers().get("To")?.parse().ok()
    }

    fn call_id(&self) -> Option<&str> {
        self.headers().get("Call-ID").map(str::trim)
    }

    fn cseq(&self) -> Option<CSeq> {
        self.headers().get("CSeq")?.parse().ok()
    }

    fn content_length(&self) -> Option<usize> {
        self.headers().get("Content-Length")?.trim().parse().ok()
    }
}

/// SIP 请求
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: Bytes,
    /// 数据报来源地址（由解析阶段填入）
    pub source: Option<SocketAddr>,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: SIP_VERSION.to_string(),
            headers: Headers::new(),
            body: Bytes::new(),
            source: None,
        }
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.headers.set("Content-Type", content_type);
        self.body = body.into();
        self
    }

    /// 消息体按 UTF-8 宽松解码（GB2312 的 ASCII 部分不受影响）
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn to_bytes(&self) -> Bytes {
        let start = format!("{} {} {}", self.method, self.uri, self.version);
        encode(&start, &self.headers, &self.body)
    }
}

impl SipHeaders for Request {
    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }
}

/// SIP 响应
#[derive(Debug, Clone)]
pub struct Response {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: Bytes,
    /// 响应来源地址（入站）
    pub source: Option<SocketAddr>,
    /// 响应发送目标（出站）
    pub destination: Option<SocketAddr>,
}

impl Response {
    pub fn new(status_code: u16, reason: impl Into<String>) -> Self {
        Self {
            version: SIP_VERSION.to_string(),
            status_code,
            reason_phrase: reason.into(),
            headers: Headers::new(),
            body: Bytes::new(),
            source: None,
            destination: None,
        }
    }

    /// 根据请求生成响应：复制 Via/From/To/Call-ID/CSeq，目标为请求来源
    pub fn from_request(req: &Request, status_code: u16) -> Self {
        let mut resp = Self::new(status_code, reason_phrase(status_code));
        for key in ["Via", "From", "To", "Call-ID", "CSeq"] {
            for value in req.headers.get_all(key) {
                resp.headers.add(key, value);
            }
        }
        resp.destination = req.source;
        resp
    }

    pub fn is_provisional(&self) -> bool {
        self.status_code < 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn to_bytes(&self) -> Bytes {
        let start = format!("{} {} {}", self.version, self.status_code, self.reason_phrase);
        encode(&start, &self.headers, &self.body)
    }
}

impl SipHeaders for Response {
    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }
}

/// SIP 消息（请求或响应）
#[derive(Debug, Clone)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    /// 从数据报解析 SIP 消息
    pub fn parse(data: &[u8], source: Option<SocketAddr>) -> Result<Self> {
        let (head, body) = split_head_body(data);
        let head = String::from_utf8_lossy(head);
        let mut lines = head.lines().map(|l| l.trim_end_matches('\r'));

        let start_line = lines
            .by_ref()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| SipError::parse("empty SIP message"))?;

        let mut headers = Headers::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| SipError::parse(format!("malformed header line: {}", line)))?;
            headers.add(canonical_name(key.trim()), value.trim());
        }

        let body = match headers.get("Content-Length").and_then(|v| v.trim().parse::<usize>().ok()) {
            Some(len) if len <= body.len() => Bytes::copy_from_slice(&body[..len]),
            _ => Bytes::copy_from_slice(body),
        };

        if start_line.starts_with("SIP/") {
            let parts: Vec<&str> = start_line.splitn(3, ' ').collect();
            if parts.len() < 2 {
                return Err(SipError::parse(format!("invalid status line: {}", start_line)));
            }
            let status_code = parts[1]
                .parse::<u16>()
                .map_err(|_| SipError::parse(format!("invalid status code: {}", parts[1])))?;
            Ok(Message::Response(Response {
                version: parts[0].to_string(),
                status_code,
                reason_phrase: parts.get(2).copied().unwrap_or_default().to_string(),
                headers,
                body,
                source,
                destination: None,
            }))
        } else {
            let parts: Vec<&str> = start_line.split_whitespace().collect();
            if parts.len() != 3 || !parts[2].starts_with("SIP/") {
                return Err(SipError::parse(format!("invalid request line: {}", start_line)));
            }
            Ok(Message::Request(Request {
                method: Method::from_token(parts[0]),
                uri: parts[1].to_string(),
                version: parts[2].to_string(),
                headers,
                body,
                source,
            }))
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Message::Request(req) => req.to_bytes(),
            Message::Response(resp) => resp.to_bytes(),
        }
    }
}

/// 以空行拆分头部与消息体，兼容裸 LF
fn split_head_body(data: &[u8]) -> (&[u8], &[u8]) {
    if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
        return (&data[..pos], &data[pos + 4..]);
    }
    if let Some(pos) = data.windows(2).position(|w| w == b"\n\n") {
        return (&data[..pos], &data[pos + 2..]);
    }
    (data, &[])
}

fn encode(start_line: &str, headers: &Headers, body: &[u8]) -> Bytes {
    let mut head = String::with_capacity(256);
    head.push_str(start_line);
    head.push_str("\r\n");

    for (key, value) in headers.iter() {
        if key.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        head.push_str(key);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

    let mut out = Vec::with_capacity(head.len() + body.len());
    out.extend_from_slice(head.as_bytes());
    out.extend_from_slice(body);
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &str = "REGISTER sip:34020000002000000001@3402000000 SIP/2.0\r\n\
                            Via: SIP/2.0/UDP 192.168.1.64:5060;rport;branch=z9hG4bK1234\r\n\
                            From: <sip:34020000001320000001@3402000000>;tag=100\r\n\
                            To: <sip:34020000001320000001@3402000000>\r\n\
                            Call-ID: 123456789@192.168.1.64\r\n\
                            CSeq: 1 REGISTER\r\n\
                            Expires: 3600\r\n\
                            Content-Length: 0\r\n\
                            \r\n";

    #[test]
    fn test_parse_register_request() {
        let source: SocketAddr = "192.168.1.64:5060".parse().unwrap();
        let msg = Message::parse(REGISTER.as_bytes(), Some(source)).unwrap();

        let Message::Request(req) = msg else { panic!("expected request") };
        assert_eq!(req.method, Method::Register);
        assert_eq!(req.uri, "sip:34020000002000000001@3402000000");
        assert_eq!(req.source, Some(source));
        assert_eq!(req.call_id(), Some("123456789@192.168.1.64"));
        assert_eq!(req.cseq().unwrap().method, Method::Register);
        assert_eq!(req.via_hop().unwrap().branch(), Some("z9hG4bK1234"));
        assert_eq!(
            req.from_header().unwrap().uri.user.as_deref(),
            Some("34020000001320000001")
        );
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_parse_compact_headers_and_body() {
        let raw = "MESSAGE sip:34020000002000000001@3402000000 SIP/2.0\n\
                   v: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKx\n\
                   f: <sip:34020000001320000001@3402000000>;tag=1\n\
                   t: <sip:34020000002000000001@3402000000>\n\
                   i: abc\n\
                   CSeq: 2 MESSAGE\n\
                   l: 5\n\
                   \n\
                   helloEXTRA";
        let Message::Request(req) = Message::parse(raw.as_bytes(), None).unwrap() else {
            panic!("expected request")
        };

        assert_eq!(req.method, Method::Message);
        assert_eq!(req.call_id(), Some("abc"));
        assert_eq!(req.content_length(), Some(5));
        assert_eq!(&req.body[..], b"hello");
    }

    #[test]
    fn test_unknown_method_is_parsed() {
        let raw = "FOO sip:a@b SIP/2.0\r\nCall-ID: 1\r\n\r\n";
        let Message::Request(req) = Message::parse(raw.as_bytes(), None).unwrap() else {
            panic!("expected request")
        };
        assert_eq!(req.method, Method::Other("FOO".to_string()));
    }

    #[test]
    fn test_parse_response() {
        let raw = "SIP/2.0 401 Unauthorized\r\n\
                   Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKx\r\n\
                   Call-ID: abc\r\n\
                   CSeq: 1 REGISTER\r\n\
                   Content-Length: 0\r\n\r\n";
        let Message::Response(resp) = Message::parse(raw.as_bytes(), None).unwrap() else {
            panic!("expected response")
        };
        assert_eq!(resp.status_code, 401);
        assert_eq!(resp.reason_phrase, "Unauthorized");
        assert!(!resp.is_success());
    }

    #[test]
    fn test_malformed_input_rejected() {
        assert!(Message::parse(b"", None).is_err());
        assert!(Message::parse(b"garbage\r\n\r\n", None).is_err());
        assert!(Message::parse(b"SIP/2.0 abc OK\r\n\r\n", None).is_err());
        assert!(Message::parse(b"REGISTER sip:a SIP/2.0\r\nno-colon-here\r\n\r\n", None).is_err());
    }

    #[test]
    fn test_response_from_request_copies_dialog_headers() {
        let source: SocketAddr = "192.168.1.64:5060".parse().unwrap();
        let Message::Request(req) = Message::parse(REGISTER.as_bytes(), Some(source)).unwrap() else {
            panic!("expected request")
        };

        let resp = Response::from_request(&req, 405);
        assert_eq!(resp.reason_phrase, "Method Not Allowed");
        assert_eq!(resp.destination, Some(source));
        assert_eq!(resp.call_id(), req.call_id());
        assert!(resp.headers.get("Expires").is_none());

        let text = String::from_utf8(resp.to_bytes().to_vec()).unwrap();
        assert!(text.starts_with("SIP/2.0 405 Method Not Allowed\r\n"));
        assert!(text.contains("CSeq: 1 REGISTER\r\n"));
        assert!(text.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn test_request_generation_recomputes_content_length() {
        let mut req = Request::new(Method::Message, "sip:34020000001320000001@192.168.1.64:5060")
            .with_body("Application/MANSCDP+xml", "<Query/>");
        req.headers.add("Content-Length", "999");

        let text = String::from_utf8(req.to_bytes().to_vec()).unwrap();
        assert!(text.starts_with("MESSAGE sip:34020000001320000001@192.168.1.64:5060 SIP/2.0\r\n"));
        assert!(text.contains("Content-Length: 8\r\n\r\n<Query/>"));
        assert!(!text.contains("999"));
    }
}
