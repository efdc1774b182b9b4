// SIP Digest 认证辅助
// 解析 Authorization 头部、计算 MD5 摘要、生成随机 branch/tag/Call-ID

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;

/// RFC 3261 要求的 branch 魔术前缀
pub const BRANCH_MAGIC: &str = "z9hG4bK";

/// Digest 认证参数（键名统一小写）
#[derive(Debug, Clone, Default)]
pub struct DigestParams {
    params: HashMap<String, String>,
}

impl DigestParams {
    /// 解析 `Digest k="v", k=v` 形式的头部值
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let rest = match value.get(..7) {
            Some(prefix) if prefix.eq_ignore_ascii_case("Digest ") => &value[7..],
            _ => value,
        };

        let mut params = HashMap::new();
        for part in split_params(rest) {
            if let Some((key, val)) = part.split_once('=') {
                let val = val.trim();
                let val = val
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(val);
                params.insert(key.trim().to_ascii_lowercase(), val.to_string());
            }
        }

        if params.is_empty() {
            None
        } else {
            Some(Self { params })
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn username(&self) -> Option<&str> {
        self.get("username")
    }

    pub fn realm(&self) -> Option<&str> {
        self.get("realm")
    }

    pub fn nonce(&self) -> Option<&str> {
        self.get("nonce")
    }

    pub fn uri(&self) -> Option<&str> {
        self.get("uri")
    }

    pub fn response(&self) -> Option<&str> {
        self.get("response")
    }

    /// qop=auth 时携带的 (nc, cnonce, qop)
    pub fn qop_auth(&self) -> Option<QopAuth<'_>> {
        let qop = self.get("qop")?;
        Some(QopAuth {
            qop,
            nc: self.get("nc")?,
            cnonce: self.get("cnonce")?,
        })
    }
}

/// 按逗号切分，忽略引号内的逗号
fn split_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts.into_iter().filter(|p| !p.is_empty()).collect()
}

#[derive(Debug, Clone, Copy)]
pub struct QopAuth<'a> {
    pub qop: &'a str,
    pub nc: &'a str,
    pub cnonce: &'a str,
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input))
}

/// 计算 Digest 响应（RFC 2617，支持无 qop 与 qop=auth）
pub fn compute_response(
    username: &str,
    realm: &str,
    password: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    qop: Option<QopAuth<'_>>,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));

    match qop {
        Some(q) => md5_hex(&format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, nonce, q.nc, q.cnonce, q.qop, ha2
        )),
        None => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

/// 401 响应中的 WWW-Authenticate 值
pub fn challenge_header(realm: &str, nonce: &str) -> String {
    format!(
        "Digest realm=\"{}\", nonce=\"{}\", algorithm=MD5",
        realm, nonce
    )
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn generate_branch() -> String {
    format!("{}{}", BRANCH_MAGIC, random_token(16))
}

pub fn generate_tag() -> String {
    random_token(10)
}

pub fn generate_call_id() -> String {
    random_token(24)
}

/// 每条消息唯一的随机标识（用作 nonce）
pub fn generate_nonce() -> String {
    format!("{:x}", rand::thread_rng().gen::<u128>())
}
