//! # 消息扫描与标注服务
//!
//! 在宿主页面中查找"看起来像消息"的元素，并为每个逻辑消息容器挂上一个置顶按钮。
//!
//! ## 扫描流程
//! 1. 按 `MESSAGE_SELECTORS` 顺序收集所有匹配元素，按首次出现去重
//! 2. 过滤：文本为空、已包含置顶按钮、或属于本系统自己的元素（按钮、提示）
//! 3. 对每个候选元素向上解析出所属容器（见 `resolve_container`）
//! 4. 容器内已有按钮则跳过；否则推导 ID、标记容器、追加按钮
//!
//! ## 幂等性
//! 第 2、4 步的两次检查保证对未变化的文档重复扫描不会产生重复按钮。
//! 扫描只写入本系统拥有的类名和元素，从不修改宿主内容。

use std::collections::{HashMap, HashSet};

use crate::dom::{Document, El, NodeId, Selector};
use crate::services::identity::derive_id;

/// 置顶按钮类名
pub const BUTTON_CLASS: &str = "chatgpt-pinner-button";
/// 已置顶按钮的附加类名
pub const PINNED_CLASS: &str = "pinned";
/// 已标注容器的类名
pub const CONTAINER_CLASS: &str = "chatgpt-pinner-message-container";
/// 提示元素类名
pub const TOAST_CLASS: &str = "chatgpt-pinner-toast";
/// 按钮上保存消息 ID 的属性
pub const MESSAGE_ID_ATTR: &str = "data-message-id";

pub const PIN_ICON: &str = "📌";
pub const UNPIN_ICON: &str = "📍";
const PIN_TITLE: &str = "Pin this message";
const UNPIN_TITLE: &str = "Unpin this message";

const ROLE_ATTR: &str = "data-message-author-role";

static ROLE: Selector = Selector::HasAttr(ROLE_ATTR);
static BUTTON: Selector = Selector::Class(BUTTON_CLASS);
static CONTAINER: Selector = Selector::Class(CONTAINER_CLASS);

/// 候选消息元素的选择器，按优先级排列
///
/// 从精确的轮次标记到宽泛的类名子串，宿主改版时后面的兜底仍可能命中。
pub static MESSAGE_SELECTORS: [Selector; 18] = [
    Selector::AttrEquals("data-testid", "conversation-turn-2"),
    Selector::AttrEquals("data-testid", "conversation-turn-3"),
    Selector::AttrEquals("data-testid", "conversation-turn-4"),
    Selector::AttrEquals("data-testid", "conversation-turn-5"),
    Selector::AttrEquals("data-testid", "conversation-turn-6"),
    Selector::AttrEquals("data-testid", "conversation-turn-7"),
    Selector::AttrEquals("data-testid", "conversation-turn-8"),
    Selector::AttrEquals("data-testid", "conversation-turn-9"),
    Selector::AttrEquals("data-testid", "conversation-turn-10"),
    Selector::HasAttr(ROLE_ATTR),
    Selector::Class("markdown"),
    Selector::Class("prose"),
    Selector::Class("whitespace-pre-wrap"),
    Selector::Class("text-base"),
    Selector::Class("leading-6"),
    Selector::ClassContains("message"),
    Selector::ClassContains("chat"),
    Selector::ClassContains("conversation"),
];

/// 容器解析时依次尝试的祖先选择器（`closest`，包含自身）
static CONTAINER_SELECTORS: [Selector; 4] = [
    Selector::AttrContains("data-testid", "conversation-turn"),
    Selector::Class("markdown"),
    Selector::Class("prose"),
    Selector::ClassContains("message"),
];

/// 一次扫描的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// 去重、过滤后的候选元素数
    pub candidates: usize,
    /// 新增的按钮数
    pub buttons_added: usize,
}

/// 按钮与其所属消息的绑定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub id: String,
    /// 推导 ID 时使用的消息元素，置顶时从它提取内容和作者
    pub message: NodeId,
}

/// 标注器：负责扫描和按钮渲染，记录每个按钮绑定的消息
#[derive(Debug, Default)]
pub struct Annotator {
    bindings: HashMap<NodeId, Binding>,
}

impl Annotator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 扫描文档，为尚未标注的消息容器追加按钮
    ///
    /// # 参数
    /// - `doc` - 宿主文档
    /// - `pinned` - 当前已置顶的 ID，用于决定新按钮的初始状态
    pub fn scan(&mut self, doc: &mut Document, pinned: &HashSet<String>) -> ScanReport {
        self.bindings.retain(|&button, _| doc.is_connected(button));

        let candidates = find_candidates(doc);
        let mut report = ScanReport {
            candidates: candidates.len(),
            buttons_added: 0,
        };

        for message in candidates {
            let container = resolve_container(doc, message);
            if doc.query_selector(container, &BUTTON).is_some() {
                continue;
            }

            let id = derive_id(doc, message);
            log::debug!("消息元素 {} 的 ID: {}", message, id);

            doc.add_class(container, CONTAINER_CLASS);
            let button = doc.insert(
                container,
                El::new("button")
                    .class(BUTTON_CLASS)
                    .attr(MESSAGE_ID_ATTR, &id),
            );
            render_button(doc, button, pinned.contains(&id));
            self.bindings.insert(button, Binding { id, message });
            report.buttons_added += 1;
        }

        log::debug!(
            "扫描完成：{} 个候选元素，新增 {} 个按钮",
            report.candidates,
            report.buttons_added
        );
        report
    }

    /// 按钮绑定的消息；不是本标注器创建的按钮时返回 None
    pub fn binding(&self, button: NodeId) -> Option<&Binding> {
        self.bindings.get(&button)
    }

    /// 按最新的置顶集合重新渲染所有按钮
    ///
    /// # 返回值
    /// 状态发生变化的按钮数
    pub fn refresh(&self, doc: &mut Document, pinned: &HashSet<String>) -> usize {
        let mut changed = 0;
        for button in doc.query_selector_all(doc.root(), &BUTTON) {
            let Some(id) = doc.attr(button, MESSAGE_ID_ATTR).map(str::to_string) else {
                continue;
            };
            let should_pin = pinned.contains(&id);
            if doc.has_class(button, PINNED_CLASS) != should_pin {
                render_button(doc, button, should_pin);
                changed += 1;
            }
        }
        changed
    }

    /// 移除所有按钮和容器标记，并清空绑定
    ///
    /// # 返回值
    /// 移除的按钮数
    pub fn strip(&mut self, doc: &mut Document) -> usize {
        let buttons = doc.query_selector_all(doc.root(), &BUTTON);
        for &button in &buttons {
            doc.remove(button);
        }
        for container in doc.query_selector_all(doc.root(), &CONTAINER) {
            doc.remove_class(container, CONTAINER_CLASS);
        }
        self.bindings.clear();
        buttons.len()
    }
}

/// 收集候选消息元素：按选择器顺序去重，并过滤掉不需要标注的元素
pub fn find_candidates(doc: &Document) -> Vec<NodeId> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for selector in &MESSAGE_SELECTORS {
        let found = doc.query_selector_all(doc.root(), selector);
        if !found.is_empty() {
            log::debug!("选择器 {} 命中 {} 个元素", selector, found.len());
        }
        for node in found {
            if seen.insert(node) {
                candidates.push(node);
            }
        }
    }

    candidates.retain(|&node| {
        !is_owned(doc, node)
            && !doc.text_content(node).trim().is_empty()
            && doc.query_selector(node, &BUTTON).is_none()
    });
    candidates
}

/// 本系统自己插入的元素（按钮、提示）及其后代
fn is_owned(doc: &Document, node: NodeId) -> bool {
    doc.closest(node, &BUTTON).is_some()
        || doc.closest(node, &Selector::Class(TOAST_CLASS)).is_some()
}

/// 解析消息元素所属的容器
///
/// 依次查找最近的会话轮次、`.markdown`、`.prose`、类名含 `message` 的祖先，
/// 都没有时取父元素；结果不存在或是 `<body>` 时取元素自身。
pub fn resolve_container(doc: &Document, element: NodeId) -> NodeId {
    let found = CONTAINER_SELECTORS
        .iter()
        .find_map(|selector| doc.closest(element, selector))
        .or_else(|| doc.parent(element));

    match found {
        Some(container) if Some(container) != doc.body() && container != doc.root() => container,
        _ => element,
    }
}

/// 插入的子树是否可能包含新消息（自身或后代带有作者角色属性）
pub fn should_rescan(doc: &Document, inserted: NodeId) -> bool {
    ROLE.matches(doc, inserted) || doc.query_selector(inserted, &ROLE).is_some()
}

/// 按置顶状态设置按钮的图标、标题和类名
pub fn render_button(doc: &mut Document, button: NodeId, pinned: bool) {
    if pinned {
        doc.add_class(button, PINNED_CLASS);
        doc.set_text(button, UNPIN_ICON);
        doc.set_attr(button, "title", UNPIN_TITLE);
    } else {
        doc.remove_class(button, PINNED_CLASS);
        doc.set_text(button, PIN_ICON);
        doc.set_attr(button, "title", PIN_TITLE);
    }
}

/// 文档中第一个携带指定消息 ID 的已连接按钮
pub fn find_button(doc: &Document, id: &str) -> Option<NodeId> {
    doc.query_selector_all(doc.root(), &BUTTON)
        .into_iter()
        .find(|&b| doc.attr(b, MESSAGE_ID_ATTR) == Some(id))
}

/// 文档中的按钮数
pub fn count_buttons(doc: &Document) -> usize {
    doc.query_selector_all(doc.root(), &BUTTON).len()
}

/// 文档中已标注的容器数
pub fn count_containers(doc: &Document) -> usize {
    doc.query_selector_all(doc.root(), &CONTAINER).len()
}
