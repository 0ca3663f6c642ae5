//! # 宿主页面文档模型
//!
//! 宿主聊天页面的 DOM 不受本系统控制，只能通过选择器启发式查询。
//! 本模块用一个基于 arena 的精简文档模型描述这一外部协作者：
//! - 元素节点：标签、属性、类名、自身文本、父子关系
//! - 查询：`query_selector` / `query_selector_all` / `closest`
//! - 事件源：`subscribe` / `unsubscribe`，插入和点击都以 `DomEvent` 发出
//!
//! 宿主适配层（或测试）负责把真实页面的变化同步到这里；
//! 扫描器只读取宿主内容，只写入自己拥有的类名和元素。
//!
//! ## 节点生命周期
//! 节点存放在 arena 中且永不回收，`remove` 只是把节点从树上摘下。
//! 因此 `NodeId` 在整个文档生命周期内都有效，已摘下的节点仍可读取，
//! 但 `is_connected` 为 false。

pub mod selector;

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

pub use selector::Selector;

/// 节点标识符：arena 中的下标
pub type NodeId = usize;

/// 事件订阅标识符
pub type SubscriptionId = u64;

/// 多个任务共享的文档句柄
///
/// 锁只在同步代码段内短暂持有，绝不跨越 `.await`。
pub type SharedDocument = Arc<Mutex<Document>>;

/// 文档事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomEvent {
    /// 一棵子树被插入到已连接的树中（携带子树根节点）
    Inserted(NodeId),
    /// 某个元素被点击
    Click(NodeId),
}

/// 单个元素节点
#[derive(Debug, Clone)]
struct Node {
    tag: String,
    attrs: Vec<(String, String)>,
    classes: Vec<String>,
    text: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Node {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attrs: Vec::new(),
            classes: Vec::new(),
            text: String::new(),
            parent: None,
            children: Vec::new(),
        }
    }
}

/// 文档
pub struct Document {
    nodes: Vec<Node>,
    subscribers: Vec<(SubscriptionId, mpsc::UnboundedSender<DomEvent>)>,
    next_subscription: SubscriptionId,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    /// 创建只有文档根节点的空文档
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new("#document")],
            subscribers: Vec::new(),
            next_subscription: 0,
        }
    }

    /// 创建带 `html > body` 骨架的文档
    pub fn with_body() -> Self {
        let mut doc = Self::new();
        let html = doc.create_element("html");
        let body = doc.create_element("body");
        // 骨架节点刚创建，不可能形成环
        let _ = doc.append_child(doc.root(), html);
        let _ = doc.append_child(html, body);
        doc
    }

    /// 文档根节点
    pub fn root(&self) -> NodeId {
        0
    }

    /// 第一个 `body` 元素
    pub fn body(&self) -> Option<NodeId> {
        self.query_selector(self.root(), &Selector::Tag("body"))
    }

    /// 创建一个尚未挂到树上的元素
    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.nodes.push(Node::new(tag));
        self.nodes.len() - 1
    }

    /// 节点 ID 是否有效
    pub fn exists(&self, node: NodeId) -> bool {
        node < self.nodes.len()
    }

    /// 节点是否挂在文档根之下
    pub fn is_connected(&self, node: NodeId) -> bool {
        self.ancestors_inclusive(node).last().copied() == Some(self.root())
    }

    /// 把 `child` 追加为 `parent` 的最后一个子节点
    ///
    /// 若 `child` 已有父节点，先从原位置摘下（与 DOM 的移动语义一致）。
    /// 插入后若 `parent` 已连接，向所有订阅者发出 `DomEvent::Inserted(child)`。
    ///
    /// # 错误
    /// 节点不存在，或 `child` 是 `parent` 的祖先（会形成环）时返回错误
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<(), String> {
        if !self.exists(parent) || !self.exists(child) {
            return Err(format!("节点不存在: parent={}, child={}", parent, child));
        }
        if self.ancestors_inclusive(parent).contains(&child) {
            return Err(format!("不能把节点 {} 插入到自己的子树中", child));
        }

        self.detach(child);
        self.nodes[child].parent = Some(parent);
        self.nodes[parent].children.push(child);

        if self.is_connected(parent) {
            self.emit(DomEvent::Inserted(child));
        }
        Ok(())
    }

    /// 按构建描述创建一棵子树并追加到 `parent` 下，返回子树根节点
    ///
    /// 整棵子树先离线构建，再一次性挂上，因此只产生一个插入事件。
    pub fn insert(&mut self, parent: NodeId, el: El) -> NodeId {
        let node = self.build(el);
        if let Err(e) = self.append_child(parent, node) {
            log::warn!("插入子树失败: {}", e);
        }
        node
    }

    fn build(&mut self, el: El) -> NodeId {
        let node = self.create_element(&el.tag);
        self.nodes[node].attrs = el.attrs;
        self.nodes[node].classes = el.classes;
        self.nodes[node].text = el.text;
        for child_el in el.children {
            let child = self.build(child_el);
            self.nodes[child].parent = Some(node);
            self.nodes[node].children.push(child);
        }
        node
    }

    /// 把节点从树上摘下（节点本身仍保留在 arena 中）
    pub fn remove(&mut self, node: NodeId) {
        if self.exists(node) {
            self.detach(node);
        }
    }

    fn detach(&mut self, node: NodeId) {
        if let Some(parent) = self.nodes[node].parent.take() {
            self.nodes[parent].children.retain(|&c| c != node);
        }
    }

    /// 元素标签（小写）
    pub fn tag(&self, node: NodeId) -> Option<&str> {
        self.nodes.get(node).map(|n| n.tag.as_str())
    }

    /// 读取属性值（类名单独存放，见 `class_attr`）
    pub fn attr(&self, node: NodeId, name: &str) -> Option<&str> {
        self.nodes
            .get(node)?
            .attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// 设置属性值（已存在则覆盖）
    pub fn set_attr(&mut self, node: NodeId, name: &str, value: &str) {
        let Some(n) = self.nodes.get_mut(node) else {
            return;
        };
        match n.attrs.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value.to_string(),
            None => n.attrs.push((name.to_string(), value.to_string())),
        }
    }

    /// 以空格连接的完整 class 属性文本
    pub fn class_attr(&self, node: NodeId) -> Option<String> {
        self.nodes.get(node).map(|n| n.classes.join(" "))
    }

    /// 是否包含指定类名（整词匹配）
    pub fn has_class(&self, node: NodeId, class: &str) -> bool {
        self.nodes
            .get(node)
            .is_some_and(|n| n.classes.iter().any(|c| c == class))
    }

    /// 添加类名（已存在则忽略）
    pub fn add_class(&mut self, node: NodeId, class: &str) {
        if let Some(n) = self.nodes.get_mut(node) {
            if !n.classes.iter().any(|c| c == class) {
                n.classes.push(class.to_string());
            }
        }
    }

    /// 移除类名
    pub fn remove_class(&mut self, node: NodeId, class: &str) {
        if let Some(n) = self.nodes.get_mut(node) {
            n.classes.retain(|c| c != class);
        }
    }

    /// 设置元素自身的文本
    pub fn set_text(&mut self, node: NodeId, text: &str) {
        if let Some(n) = self.nodes.get_mut(node) {
            n.text = text.to_string();
        }
    }

    /// 元素及其所有后代文本按文档顺序拼接的结果（对应 `textContent`）
    pub fn text_content(&self, node: NodeId) -> String {
        let mut out = String::new();
        self.collect_text(node, &mut out);
        out
    }

    fn collect_text(&self, node: NodeId, out: &mut String) {
        let Some(n) = self.nodes.get(node) else {
            return;
        };
        out.push_str(&n.text);
        for &child in &n.children {
            self.collect_text(child, out);
        }
    }

    /// 父节点
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node)?.parent
    }

    /// 子节点列表
    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.nodes
            .get(node)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    /// 前一个兄弟节点
    pub fn previous_sibling(&self, node: NodeId) -> Option<NodeId> {
        let siblings = self.children(self.parent(node)?);
        let index = siblings.iter().position(|&c| c == node)?;
        index.checked_sub(1).map(|i| siblings[i])
    }

    /// 所有后代节点（不含自身），按文档顺序
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(node).iter().rev().copied().collect();
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.children(current).iter().rev());
        }
        out
    }

    /// 从自身开始向上直到根的节点链
    fn ancestors_inclusive(&self, node: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut current = self.exists(node).then_some(node);
        while let Some(n) = current {
            chain.push(n);
            current = self.nodes[n].parent;
        }
        chain
    }

    /// 第一个匹配的后代（不含自身）
    pub fn query_selector(&self, scope: NodeId, selector: &Selector) -> Option<NodeId> {
        self.descendants(scope)
            .into_iter()
            .find(|&n| selector.matches(self, n))
    }

    /// 所有匹配的后代（不含自身），按文档顺序
    pub fn query_selector_all(&self, scope: NodeId, selector: &Selector) -> Vec<NodeId> {
        self.descendants(scope)
            .into_iter()
            .filter(|&n| selector.matches(self, n))
            .collect()
    }

    /// 从自身开始向上查找第一个匹配的祖先
    pub fn closest(&self, node: NodeId, selector: &Selector) -> Option<NodeId> {
        self.ancestors_inclusive(node)
            .into_iter()
            .find(|&n| selector.matches(self, n))
    }

    // ======== 事件源 ========

    /// 订阅文档事件
    ///
    /// 返回订阅 ID 和接收端；丢弃接收端等同于退订（下次发出事件时清理）。
    pub fn subscribe(&mut self) -> (SubscriptionId, mpsc::UnboundedReceiver<DomEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.subscribers.push((id, tx));
        (id, rx)
    }

    /// 显式退订
    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscribers.retain(|(sid, _)| *sid != id);
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// 模拟用户点击元素
    pub fn click(&mut self, node: NodeId) {
        if self.exists(node) {
            self.emit(DomEvent::Click(node));
        }
    }

    fn emit(&mut self, event: DomEvent) {
        self.subscribers.retain(|(_, tx)| tx.send(event).is_ok());
    }
}

/// 子树构建描述
///
/// ```ignore
/// doc.insert(body, El::new("div").class("markdown").text("Hello"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct El {
    tag: String,
    attrs: Vec<(String, String)>,
    classes: Vec<String>,
    text: String,
    children: Vec<El>,
}

impl El {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..Self::default()
        }
    }

    pub fn class(mut self, class: &str) -> Self {
        self.classes.push(class.to_string());
        self
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.push((name.to_string(), value.to_string()));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn child(mut self, child: El) -> Self {
        self.children.push(child);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_content_concatenates_in_document_order() {
        let mut doc = Document::with_body();
        let body = doc.body().unwrap();
        let node = doc.insert(
            body,
            El::new("div")
                .text("a")
                .child(El::new("p").text("b").child(El::new("span").text("c")))
                .child(El::new("p").text("d")),
        );
        assert_eq!(doc.text_content(node), "abcd");
    }

    #[test]
    fn query_and_closest() {
        let mut doc = Document::with_body();
        let body = doc.body().unwrap();
        let turn = doc.insert(
            body,
            El::new("article")
                .attr("data-testid", "conversation-turn-2")
                .child(El::new("div").class("markdown").child(El::new("p").text("hi"))),
        );
        let p = doc.query_selector(turn, &Selector::Tag("p")).unwrap();
        let turn_sel = Selector::AttrContains("data-testid", "conversation-turn");

        assert_eq!(doc.closest(p, &turn_sel), Some(turn));
        assert_eq!(doc.closest(turn, &turn_sel), Some(turn));
        assert_eq!(doc.query_selector(turn, &turn_sel), None);
        assert_eq!(doc.query_selector_all(body, &Selector::Tag("div")).len(), 1);
    }

    #[test]
    fn append_moves_and_rejects_cycles() {
        let mut doc = Document::with_body();
        let body = doc.body().unwrap();
        let a = doc.insert(body, El::new("div"));
        let b = doc.insert(a, El::new("div"));

        assert!(doc.append_child(b, a).is_err());
        doc.append_child(body, b).unwrap();
        assert_eq!(doc.parent(b), Some(body));
        assert!(doc.is_connected(b));
        assert!(doc.children(a).is_empty());

        doc.remove(b);
        assert!(!doc.is_connected(b));
        assert!(doc.exists(b));
    }

    #[test]
    fn events_reach_live_subscribers_only() {
        let mut doc = Document::with_body();
        let body = doc.body().unwrap();
        let (keep, mut rx) = doc.subscribe();
        let (_, dropped) = doc.subscribe();
        drop(dropped);

        let detached = doc.create_element("div");
        let node = doc.insert(body, El::new("div"));
        doc.click(node);

        assert_eq!(rx.try_recv().unwrap(), DomEvent::Inserted(node));
        assert_eq!(rx.try_recv().unwrap(), DomEvent::Click(node));
        assert!(rx.try_recv().is_err());
        assert_eq!(doc.subscriber_count(), 1);

        // 挂到未连接的节点下不产生事件
        let child = doc.create_element("span");
        doc.append_child(detached, child).unwrap();
        assert!(rx.try_recv().is_err());

        doc.unsubscribe(keep);
        assert_eq!(doc.subscriber_count(), 0);
    }
}
