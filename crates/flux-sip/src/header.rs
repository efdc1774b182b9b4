// SIP 头部模型
// 有序头部表 + Via / From / To / CSeq 的结构化视图

use crate::error::{Result, SipError};
use crate::message::Method;
use std::fmt;
use std::str::FromStr;

/// 紧凑头部名（RFC 3261 §7.3.3）到规范名的映射
const COMPACT_FORMS: &[(&str, &str)] = &[
    ("v", "Via"),
    ("f", "From"),
    ("t", "To"),
    ("i", "Call-ID"),
    ("l", "Content-Length"),
    ("c", "Content-Type"),
    ("m", "Contact"),
    ("k", "Supported"),
    ("s", "Subject"),
];

/// 将紧凑头部名展开为规范名，其余原样返回
pub fn canonical_name(name: &str) -> String {
    COMPACT_FORMS
        .iter()
        .find(|(short, _)| short.eq_ignore_ascii_case(name))
        .map(|(_, long)| long.to_string())
        .unwrap_or_else(|| name.to_string())
}

/// 有序头部表（名称大小写不敏感，允许重复）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// 第一个同名头部
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 所有同名头部（保持原始顺序）
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// 追加头部
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// 替换头部：保留第一个位置，删除其余同名项
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter().position(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(pos) => {
                self.entries[pos].1 = value;
                let mut index = 0;
                self.entries.retain(|(k, _)| {
                    let keep = index <= pos || !k.eq_ignore_ascii_case(name);
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `;key=value;flag` 形式的参数表
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(Vec<(String, Option<String>)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析参数串，允许带或不带前导 `;`
    pub fn parse(s: &str) -> Self {
        let params = s
            .split(';')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| match p.split_once('=') {
                Some((k, v)) => (k.trim().to_string(), Some(v.trim().trim_matches('"').to_string())),
                None => (p.to_string(), None),
            })
            .collect();
        Params(params)
    }

    pub fn has(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k.eq_ignore_ascii_case(key))
    }

    /// 取参数值；无值的标志参数返回 None
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn set(&mut self, key: &str, value: Option<String>) {
        match self.0.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key.to_string(), value)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.0 {
            match v {
                Some(v) => write!(f, ";{}={}", k, v)?,
                None => write!(f, ";{}", k)?,
            }
        }
        Ok(())
    }
}

/// 拆分 `host[:port]`，支持 `[v6]:port`
fn split_host_port(s: &str) -> Result<(String, Option<u16>)> {
    let s = s.trim();
    if s.is_empty() {
        return Err(SipError::parse("empty host"));
    }

    if let Some(rest) = s.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| SipError::parse(format!("invalid IPv6 host: {}", s)))?;
        let host = rest[..end].to_string();
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None => None,
        };
        return Ok((host, port));
    }

    match s.rsplit_once(':') {
        Some((host, port)) => Ok((host.to_string(), Some(parse_port(port)?))),
        None => Ok((s.to_string(), None)),
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.trim()
        .parse::<u16>()
        .map_err(|_| SipError::parse(format!("invalid port: {}", s)))
}

fn fmt_host(host: &str) -> String {
    if host.contains(':') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

/// Via 头部中的一跳
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHop {
    /// 协议名与版本（SIP/2.0）
    pub protocol: String,

    /// 传输协议（UDP/TCP）
    pub transport: String,

    pub host: String,

    pub port: Option<u16>,

    /// branch / rport / received 等参数
    pub params: Params,
}

impl ViaHop {
    pub fn new(transport: &str, host: &str, port: Option<u16>) -> Self {
        Self {
            protocol: "SIP/2.0".to_string(),
            transport: transport.to_string(),
            host: host.to_string(),
            port,
            params: Params::new(),
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.params.get("branch")
    }

    /// rport 的值；只带标志不带值时为 None
    pub fn rport(&self) -> Option<&str> {
        self.params.get("rport")
    }

    pub fn received(&self) -> Option<&str> {
        self.params.get("received")
    }
}

impl FromStr for ViaHop {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (sent_protocol, rest) = s
            .split_once(char::is_whitespace)
            .ok_or_else(|| SipError::parse(format!("invalid Via: {}", s)))?;

        let (protocol, transport) = sent_protocol
            .rsplit_once('/')
            .ok_or_else(|| SipError::parse(format!("invalid Via protocol: {}", sent_protocol)))?;

        let rest = rest.trim();
        let (host_port, params) = match rest.split_once(';') {
            Some((hp, p)) => (hp, Params::parse(p)),
            None => (rest, Params::new()),
        };
        let (host, port) = split_host_port(host_port)?;

        Ok(Self {
            protocol: protocol.to_string(),
            transport: transport.to_ascii_uppercase(),
            host,
            port,
            params,
        })
    }
}

impl fmt::Display for ViaHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", self.protocol, self.transport, fmt_host(&self.host))?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)
    }
}

/// SIP URI（sip:user@host:port;params）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipUri {
    pub scheme: String,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl SipUri {
    pub fn new(user: Option<&str>, host: &str, port: Option<u16>) -> Self {
        Self {
            scheme: "sip".to_string(),
            user: user.map(str::to_string),
            host: host.to_string(),
            port,
            params: Params::new(),
        }
    }
}

impl FromStr for SipUri {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| SipError::parse(format!("invalid URI: {}", s)))?;
        if !scheme.eq_ignore_ascii_case("sip") && !scheme.eq_ignore_ascii_case("sips") {
            return Err(SipError::parse(format!("unsupported URI scheme: {}", scheme)));
        }

        let (addr, params) = match rest.split_once(';') {
            Some((a, p)) => (a, Params::parse(p)),
            None => (rest, Params::new()),
        };

        let (user, host_port) = match addr.rsplit_once('@') {
            Some((userinfo, hp)) => {
                // 丢弃 user:password 中的密码部分
                let user = userinfo.split(':').next().unwrap_or_default();
                let user = if user.is_empty() { None } else { Some(user.to_string()) };
                (user, hp)
            }
            None => (None, addr),
        };
        let (host, port) = split_host_port(host_port)?;

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            user,
            host,
            port,
            params,
        })
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", fmt_host(&self.host))?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)
    }
}

/// From / To / Contact 使用的 name-addr
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: SipUri,
    /// 头部参数（tag 等）
    pub params: Params,
}

impl NameAddr {
    pub fn new(uri: SipUri) -> Self {
        Self {
            display_name: None,
            uri,
            params: Params::new(),
        }
    }

    pub fn tag(&self) -> Option<&str> {
        self.params.get("tag")
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.params.set("tag", Some(tag.to_string()));
        self
    }
}

impl FromStr for NameAddr {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(open) = s.find('<') {
            let close = s[open..]
                .find('>')
                .map(|i| open + i)
                .ok_or_else(|| SipError::parse(format!("unterminated name-addr: {}", s)))?;

            let display = s[..open].trim().trim_matches('"').trim();
            let uri = s[open + 1..close].parse::<SipUri>()?;
            let params = Params::parse(&s[close + 1..]);

            Ok(Self {
                display_name: if display.is_empty() { None } else { Some(display.to_string()) },
                uri,
                params,
            })
        } else {
            // addr-spec 形式：分号后的参数属于头部而不是 URI
            let (uri, params) = match s.split_once(';') {
                Some((u, p)) => (u, Params::parse(p)),
                None => (s, Params::new()),
            };
            Ok(Self {
                display_name: None,
                uri: uri.parse()?,
                params,
            })
        }
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>{}", self.uri, self.params)
    }
}

/// CSeq 头部
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl FromStr for CSeq {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace();
        let seq = parts
            .next()
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| SipError::parse(format!("invalid CSeq: {}", s)))?;
        let method = parts
            .next()
            .map(Method::from_token)
            .ok_or_else(|| SipError::parse(format!("CSeq without method: {}", s)))?;
        Ok(Self { seq, method })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}
