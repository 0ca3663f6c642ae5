//! # 消息身份推导器
//!
//! 宿主页面会反复重建/虚拟化消息 DOM，且不提供稳定 ID。
//! 本模块只根据消息"提取出的内容 + 作者"推导 ID，与 DOM 位置无关，
//! 因此同一条逻辑消息在多次扫描、甚至页面刷新后得到同一个 ID。
//!
//! ## 推导流程
//! 1. 内容：按 `CONTENT_SELECTORS` 顺序查找第一个文本非空的后代，
//!    都未命中时取整个元素的文本，仍为空则为 `Message content not available`
//! 2. 作者：按 `all_author_strategies()` 注册表顺序尝试，都未命中则为 `Unknown`
//! 3. 规范化：去掉非 ASCII 字符，再去掉字母数字、空白、`-`、`_` 以外的字符；
//!    内容只保留前 50 个字符
//! 4. 编码：`作者-内容` 做 base64，再去掉不适合放进属性值的字符
//!
//! ## 失败模式
//! 节点不存在等导致提取失败时，回退为"时间 + 随机后缀"的 ID。
//! 这条路径**不是确定性的**：以这种 ID 置顶的消息在重新扫描后不会被识别为同一条。

use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::Rng;
use regex::Regex;

use crate::dom::{Document, NodeId, Selector};
use crate::models::pinned::{AUTHOR_ASSISTANT, AUTHOR_UNKNOWN, AUTHOR_USER};

/// 所有内容选择器都未命中且元素本身无文本时的占位内容
pub const CONTENT_UNAVAILABLE: &str = "Message content not available";

/// 参与 ID 计算的内容最大字符数
const ID_CONTENT_CHARS: usize = 50;

const ROLE_ATTR: &str = "data-message-author-role";
const TEST_ID_ATTR: &str = "data-testid";
const TURN_MARKER: &str = "conversation-turn";

static ROLE: Selector = Selector::HasAttr(ROLE_ATTR);
static DIV: Selector = Selector::Tag("div");

/// 会话轮次容器：`[data-testid*="conversation-turn"]`
pub static TURN_SELECTOR: Selector = Selector::AttrContains(TEST_ID_ATTR, TURN_MARKER);

/// 内容提取的选择器回退链，按优先级排列
static CONTENT_SELECTORS: [Selector; 6] = [
    Selector::Adjacent(&ROLE, &DIV),
    Selector::Class("markdown"),
    Selector::Class("prose"),
    Selector::Class("whitespace-pre-wrap"),
    Selector::Tag("p"),
    Selector::Tag("div"),
];

/// 作者文本标签的选择器回退链
static AUTHOR_LABEL_SELECTORS: [Selector; 4] = [
    Selector::HasAttr(ROLE_ATTR),
    Selector::Class("author"),
    Selector::Class("user"),
    Selector::Class("assistant"),
];

/// 非 ASCII 字符
static NON_ASCII_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\x00-\x7F]").unwrap());

/// 字母数字、空白、`-`、`_` 以外的字符
static UNSAFE_TEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9\s\-_]").unwrap());

/// 编码结果中不适合作为属性值的字符（base64 的 `+`、`/`、`=`）
static UNSAFE_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9]").unwrap());

/// 作者提取策略：命中时返回作者，未命中返回 None
pub type AuthorStrategy = fn(&Document, NodeId) -> Option<String>;

/// 作者提取策略注册表
///
/// 按数组顺序依次尝试，第一个返回 `Some` 的策略胜出。
pub fn all_author_strategies() -> [(&'static str, AuthorStrategy); 4] {
    [
        ("role_attribute", author_from_role_attribute),
        ("label_text", author_from_label_text),
        ("turn_test_id", author_from_turn_test_id),
        ("turn_parity", author_from_turn_parity),
    ]
}

/// 置顶时需要的消息快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSnapshot {
    pub content: String,
    pub author: String,
}

impl MessageSnapshot {
    /// 从消息元素提取当前的内容和作者
    pub fn capture(doc: &Document, node: NodeId) -> Self {
        Self {
            content: extract_content(doc, node),
            author: extract_author(doc, node),
        }
    }
}

// ============ 公开入口 ============

/// 推导消息元素的 ID
///
/// 确定性路径失败时回退为非确定性 ID（见模块文档）。
pub fn derive_id(doc: &Document, node: NodeId) -> String {
    match try_derive_id(doc, node) {
        Ok(id) => id,
        Err(e) => {
            log::warn!("推导消息 ID 失败，使用随机 ID: {}", e);
            fallback_id()
        }
    }
}

/// 提取消息内容；失败时返回占位内容
pub fn extract_content(doc: &Document, node: NodeId) -> String {
    try_extract_content(doc, node).unwrap_or_else(|e| {
        log::debug!("提取消息内容失败: {}", e);
        CONTENT_UNAVAILABLE.to_string()
    })
}

/// 提取消息作者；失败时返回 `Unknown`
pub fn extract_author(doc: &Document, node: NodeId) -> String {
    try_extract_author(doc, node).unwrap_or_else(|e| {
        log::debug!("提取消息作者失败: {}", e);
        AUTHOR_UNKNOWN.to_string()
    })
}

/// 把作者和内容编码为 ID
///
/// 纯函数：仅依赖两段文本规范化后的结果。
pub fn encode_identity(author: &str, content: &str) -> String {
    let safe_content: String = normalize(content).chars().take(ID_CONTENT_CHARS).collect();
    let safe_author = normalize(author);
    let id_string = format!("{}-{}", safe_author.trim(), safe_content.trim());
    let encoded = STANDARD.encode(id_string.as_bytes());
    UNSAFE_ID_RE.replace_all(&encoded, "").into_owned()
}

/// 非确定性的回退 ID：`msg_<毫秒时间戳>_<9 位 base36 随机串>`
pub fn fallback_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("msg_{}_{}", chrono::Utc::now().timestamp_millis(), suffix)
}

// ============ 内部实现 ============

fn try_derive_id(doc: &Document, node: NodeId) -> Result<String, String> {
    let content = try_extract_content(doc, node)?;
    let author = try_extract_author(doc, node)?;
    Ok(encode_identity(&author, &content))
}

fn ensure_exists(doc: &Document, node: NodeId) -> Result<(), String> {
    if doc.exists(node) {
        Ok(())
    } else {
        Err(format!("消息节点 {} 不存在", node))
    }
}

fn try_extract_content(doc: &Document, node: NodeId) -> Result<String, String> {
    ensure_exists(doc, node)?;

    for selector in &CONTENT_SELECTORS {
        if let Some(text) = first_non_empty_text(doc, node, selector) {
            return Ok(text);
        }
    }

    let whole = doc.text_content(node);
    let whole = whole.trim();
    Ok(if whole.is_empty() {
        CONTENT_UNAVAILABLE.to_string()
    } else {
        whole.to_string()
    })
}

fn try_extract_author(doc: &Document, node: NodeId) -> Result<String, String> {
    ensure_exists(doc, node)?;

    for (name, strategy) in all_author_strategies() {
        if let Some(author) = strategy(doc, node) {
            log::debug!("作者由策略 {} 确定: {}", name, author);
            return Ok(author);
        }
    }
    Ok(AUTHOR_UNKNOWN.to_string())
}

/// 第一个匹配选择器且文本非空的后代的文本（已 trim）
///
/// 会检查该选择器的全部匹配，而不只是第一个：首个匹配为空时，
/// 同一选择器的后续匹配仍可能提供文本，因此参与 ID 计算的文本
/// 可能来自较靠后的元素。
fn first_non_empty_text(doc: &Document, node: NodeId, selector: &Selector) -> Option<String> {
    doc.query_selector_all(node, selector)
        .into_iter()
        .map(|n| doc.text_content(n).trim().to_string())
        .find(|text| !text.is_empty())
}

fn normalize(text: &str) -> String {
    let ascii = NON_ASCII_RE.replace_all(text, "");
    UNSAFE_TEXT_RE.replace_all(&ascii, "").into_owned()
}

/// 作者文本规范化
///
/// 包含 "user"/"you" → `User`；包含 "assistant"/"chatgpt" → `Assistant`；
/// 其余保留原文。
pub fn normalize_author(raw: &str) -> String {
    let lower = raw.to_lowercase();
    if lower.contains("user") || lower.contains("you") {
        AUTHOR_USER.to_string()
    } else if lower.contains("assistant") || lower.contains("chatgpt") {
        AUTHOR_ASSISTANT.to_string()
    } else {
        raw.to_string()
    }
}

/// 策略 1：元素自身或其后代上的 `data-message-author-role` 属性值
fn author_from_role_attribute(doc: &Document, node: NodeId) -> Option<String> {
    let carrier = if ROLE.matches(doc, node) {
        node
    } else {
        doc.query_selector(node, &ROLE)?
    };
    let role = doc.attr(carrier, ROLE_ATTR)?.trim();
    (!role.is_empty()).then(|| normalize_author(role))
}

/// 策略 2：作者标签元素的文本
fn author_from_label_text(doc: &Document, node: NodeId) -> Option<String> {
    AUTHOR_LABEL_SELECTORS
        .iter()
        .find_map(|selector| first_non_empty_text(doc, node, selector))
        .map(|text| normalize_author(&text))
}

/// 策略 3：所在轮次容器的 test id 中带有角色名
fn author_from_turn_test_id(doc: &Document, node: NodeId) -> Option<String> {
    let turn = doc.closest(node, &TURN_SELECTOR)?;
    let test_id = doc.attr(turn, TEST_ID_ATTR)?;
    if test_id.contains("user") {
        Some(AUTHOR_USER.to_string())
    } else if test_id.contains("assistant") {
        Some(AUTHOR_ASSISTANT.to_string())
    } else {
        None
    }
}

/// 策略 4：所在轮次在页面全部轮次中的位置奇偶（偶数 → User，奇数 → Assistant）
fn author_from_turn_parity(doc: &Document, node: NodeId) -> Option<String> {
    let turn = doc.closest(node, &TURN_SELECTOR)?;
    let index = doc
        .query_selector_all(doc.root(), &TURN_SELECTOR)
        .iter()
        .position(|&t| t == turn)?;
    let author = if index % 2 == 0 {
        AUTHOR_USER
    } else {
        AUTHOR_ASSISTANT
    };
    Some(author.to_string())
}
