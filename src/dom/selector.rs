//! # 选择器
//!
//! 宿主页面启发式匹配所需的最小 CSS 选择器子集。
//! 每个选择器都是一个纯谓词：只读取文档，不产生副作用，可独立测试。

use std::fmt;

use memchr::memmem;

use super::{Document, NodeId};

/// 选择器
///
/// 覆盖扫描器和身份推导器用到的全部形式：
/// 标签、类名、类名子串、属性存在、属性相等、属性子串，以及相邻兄弟组合器。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    /// `tag`
    Tag(&'static str),
    /// `.class`
    Class(&'static str),
    /// `[class*="needle"]`
    ClassContains(&'static str),
    /// `[attr]`
    HasAttr(&'static str),
    /// `[attr="value"]`
    AttrEquals(&'static str, &'static str),
    /// `[attr*="needle"]`
    AttrContains(&'static str, &'static str),
    /// `A + B`：节点匹配 B，且其前一个元素兄弟匹配 A
    Adjacent(&'static Selector, &'static Selector),
}

impl Selector {
    /// 判断节点是否匹配本选择器
    ///
    /// 节点不存在（ID 无效）时返回 false。
    pub fn matches(&self, doc: &Document, node: NodeId) -> bool {
        let Some(tag) = doc.tag(node) else {
            return false;
        };

        match *self {
            Selector::Tag(name) => tag.eq_ignore_ascii_case(name),
            Selector::Class(name) => doc.has_class(node, name),
            Selector::ClassContains(needle) => {
                contains(&doc.class_attr(node).unwrap_or_default(), needle)
            }
            Selector::HasAttr(name) => doc.attr(node, name).is_some(),
            Selector::AttrEquals(name, value) => doc.attr(node, name) == Some(value),
            Selector::AttrContains(name, needle) => doc
                .attr(node, name)
                .is_some_and(|value| contains(value, needle)),
            Selector::Adjacent(prev, current) => {
                current.matches(doc, node)
                    && doc
                        .previous_sibling(node)
                        .is_some_and(|sibling| prev.matches(doc, sibling))
            }
        }
    }
}

/// 子串匹配；与 CSS `*=` 一致，空 needle 永不匹配
fn contains(haystack: &str, needle: &str) -> bool {
    !needle.is_empty() && memmem::find(haystack.as_bytes(), needle.as_bytes()).is_some()
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Tag(name) => write!(f, "{}", name),
            Selector::Class(name) => write!(f, ".{}", name),
            Selector::ClassContains(needle) => write!(f, "[class*=\"{}\"]", needle),
            Selector::HasAttr(name) => write!(f, "[{}]", name),
            Selector::AttrEquals(name, value) => write!(f, "[{}=\"{}\"]", name, value),
            Selector::AttrContains(name, needle) => write!(f, "[{}*=\"{}\"]", name, needle),
            Selector::Adjacent(prev, current) => write!(f, "{} + {}", prev, current),
        }
    }
}
