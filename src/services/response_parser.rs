//! 响应解析服务 - 业务能力层
//!
//! 模型返回的文本不一定是干净的 JSON，这里按固定顺序尝试四种策略：
//!
//! 1. `Direct`          直接解析去掉首尾空白的全文
//! 2. `StripWrapping`   去掉 ``` 代码块标记和前后说明文字后再解析
//! 3. `BalancedSpan`    找第一个括号配对完整、结构合法的 `{…}` / `[…]` 片段
//! 4. `FieldExtraction` 用正则直接抽取 `"text"` 字段
//!
//! 只有结构符合预期（列表键下的数组或裸数组，元素是带非空 `text` 的对象）才算成功，
//! 第一个成功的策略胜出。全部失败时返回带原文的 `ParseFailure`。
//! 所有函数都是纯函数，同样的输入永远得到同样的结果。

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{CandidateMetaphor, ValidatedMetaphor};

/// 检测阶段响应中的列表键
pub const CANDIDATES_KEY: &str = "candidates";
/// 验证阶段响应中的列表键
pub const METAPHORS_KEY: &str = "metaphors";

/// 解析策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStrategy {
    Direct,
    StripWrapping,
    BalancedSpan,
    FieldExtraction,
}

impl ParseStrategy {
    /// 尝试顺序
    pub const CHAIN: [ParseStrategy; 4] = [
        ParseStrategy::Direct,
        ParseStrategy::StripWrapping,
        ParseStrategy::BalancedSpan,
        ParseStrategy::FieldExtraction,
    ];

    fn apply(self, raw: &str, list_key: &str) -> Option<Vec<ExtractedItem>> {
        let value = match self {
            ParseStrategy::Direct => parse_direct(raw),
            ParseStrategy::StripWrapping => parse_stripped(raw),
            ParseStrategy::BalancedSpan => return parse_balanced_span(raw, list_key),
            ParseStrategy::FieldExtraction => extract_fields(raw),
        };
        items_from_value(&value?, list_key)
    }
}

impl fmt::Display for ParseStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParseStrategy::Direct => "direct",
            ParseStrategy::StripWrapping => "strip_wrapping",
            ParseStrategy::BalancedSpan => "balanced_span",
            ParseStrategy::FieldExtraction => "field_extraction",
        };
        f.write_str(name)
    }
}

/// 从响应里抽出的一条记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedItem {
    pub text: String,
    pub context: String,
    pub source_domain: Option<String>,
}

impl From<ExtractedItem> for CandidateMetaphor {
    fn from(item: ExtractedItem) -> Self {
        CandidateMetaphor {
            text: item.text,
            context: item.context,
            source_domain: item.source_domain,
        }
    }
}

impl From<ExtractedItem> for ValidatedMetaphor {
    fn from(item: ExtractedItem) -> Self {
        ValidatedMetaphor {
            text: item.text,
            context: item.context,
        }
    }
}

/// 解析失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    pub raw: String,
    pub last_strategy: ParseStrategy,
}

/// 解析结果；空列表是成功，不是失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome<T> {
    Parsed { value: T, strategy: ParseStrategy },
    Failed(ParseFailure),
}

impl<T> ParseOutcome<T> {
    pub fn is_parsed(&self) -> bool {
        matches!(self, ParseOutcome::Parsed { .. })
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ParseOutcome<U> {
        match self {
            ParseOutcome::Parsed { value, strategy } => ParseOutcome::Parsed {
                value: f(value),
                strategy,
            },
            ParseOutcome::Failed(failure) => ParseOutcome::Failed(failure),
        }
    }
}

/// 按策略链解析，`list_key` 为对象形态时期望的数组键
pub fn parse_items(raw: &str, list_key: &str) -> ParseOutcome<Vec<ExtractedItem>> {
    for strategy in ParseStrategy::CHAIN {
        if let Some(value) = strategy.apply(raw, list_key) {
            return ParseOutcome::Parsed { value, strategy };
        }
    }

    ParseOutcome::Failed(ParseFailure {
        raw: raw.to_string(),
        last_strategy: ParseStrategy::FieldExtraction,
    })
}

/// 解析检测阶段的响应
pub fn parse_candidates(raw: &str) -> ParseOutcome<Vec<CandidateMetaphor>> {
    parse_items(raw, CANDIDATES_KEY).map(|items| items.into_iter().map(Into::into).collect())
}

/// 解析验证阶段的响应
pub fn parse_validated(raw: &str) -> ParseOutcome<Vec<ValidatedMetaphor>> {
    parse_items(raw, METAPHORS_KEY).map(|items| items.into_iter().map(Into::into).collect())
}

// ========== 结构校验 ==========

fn items_from_value(value: &Value, list_key: &str) -> Option<Vec<ExtractedItem>> {
    let array = match value {
        Value::Array(array) => array,
        Value::Object(map) => map.get(list_key)?.as_array()?,
        _ => return None,
    };
    array.iter().map(item_from_value).collect()
}

fn item_from_value(value: &Value) -> Option<ExtractedItem> {
    let object = value.as_object()?;
    let text = object.get("text")?.as_str()?.trim();
    if text.is_empty() {
        return None;
    }

    let field = |key: &str| object.get(key).and_then(Value::as_str).map(str::to_string);
    Some(ExtractedItem {
        text: text.to_string(),
        context: field("context").unwrap_or_default(),
        source_domain: field("source_domain"),
    })
}

// ========== 策略 ==========

fn parse_direct(raw: &str) -> Option<Value> {
    serde_json::from_str(raw.trim()).ok()
}

fn parse_stripped(raw: &str) -> Option<Value> {
    let inner = fenced_body(raw).unwrap_or(raw);
    let start = inner.find(['{', '['])?;
    let end = inner.rfind(['}', ']'])?;
    if end < start {
        return None;
    }
    serde_json::from_str(&inner[start..=end]).ok()
}

/// 第一个代码块的内容（跳过 ```json 这样的语言标记行）
fn fenced_body(raw: &str) -> Option<&str> {
    let open = raw.find("```")?;
    let after_marker = &raw[open + 3..];
    let body_start = after_marker.find('\n').map_or(0, |i| i + 1);
    let body = &after_marker[body_start..];
    let close = body.find("```").unwrap_or(body.len());
    Some(&body[..close])
}

/// 第一个能解析且结构合法的配对片段；`[2]` 这类能解析但结构不对的片段会被跳过
fn parse_balanced_span(raw: &str, list_key: &str) -> Option<Vec<ExtractedItem>> {
    raw.char_indices()
        .filter(|(_, c)| *c == '{' || *c == '[')
        .filter_map(|(start, _)| balanced_end(raw, start).map(|end| &raw[start..end]))
        .filter_map(|span| serde_json::from_str::<Value>(span).ok())
        .find_map(|value| items_from_value(&value, list_key))
}

/// 从 `start` 处的开括号开始做配对，跳过字符串里的括号；返回闭括号之后的字节位置
fn balanced_end(raw: &str, start: usize) -> Option<usize> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in raw[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(c) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(start + offset + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

fn string_field_regex(key: &str) -> Option<Regex> {
    Regex::new(&format!(r#""{}"\s*:\s*"((?:[^"\\]|\\.)*)""#, key)).ok()
}

/// 按对象边界切段，每段里的 `"text"` 和同段的 `context` / `source_domain` 组成一条记录
fn extract_fields(raw: &str) -> Option<Value> {
    let text_re = string_field_regex("text")?;
    let optional_fields = [
        ("context", string_field_regex("context")?),
        ("source_domain", string_field_regex("source_domain")?),
    ];

    let mut items = Vec::new();
    for segment in object_segments(raw) {
        let matches: Vec<_> = text_re.captures_iter(segment).collect();
        for (i, caps) in matches.iter().enumerate() {
            let (Some(whole), Some(text)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            // 同一段里有多个 text 时，只取到下一个 text 为止
            let field_scope = if matches.len() == 1 {
                segment
            } else {
                let scope_end = matches
                    .get(i + 1)
                    .and_then(|next| next.get(0))
                    .map_or(segment.len(), |m| m.start());
                &segment[whole.end()..scope_end]
            };

            let mut object = serde_json::Map::new();
            object.insert("text".to_string(), Value::String(unescape(text.as_str())));
            for (key, re) in &optional_fields {
                if let Some(value) = re.captures(field_scope).and_then(|c| c.get(1)) {
                    object.insert(key.to_string(), Value::String(unescape(value.as_str())));
                }
            }
            items.push(Value::Object(object));
        }
    }

    if items.is_empty() {
        return None;
    }
    Some(Value::Array(items))
}

/// 在字符串外的 `{` / `}` 处切开文本
fn object_segments(raw: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut segment_start = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in raw.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '}' => {
                segments.push(&raw[segment_start..i]);
                segment_start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&raw[segment_start..]);
    segments
}

fn unescape(captured: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{}\"", captured))
        .unwrap_or_else(|_| captured.to_string())
}
