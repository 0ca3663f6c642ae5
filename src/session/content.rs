//! # 内容会话
//!
//! 注入到单个宿主页面中的上下文。每个页面拥有自己的 `ContentSession`，
//! 会话之间不共享内存，只通过存储和广播中心协作。
//!
//! ## 生命周期
//! 1. `wait_for_host_ready`：每秒检查一次宿主页面标记，最长等待 10 秒
//! 2. `init`：加载偏好和置顶集合、订阅文档事件、向广播中心注册；
//!    失败时 2 秒后重试，次数不限
//! 3. `run`：单一事件循环，按到达顺序处理
//!    - 首次扫描（1 秒）和兜底扫描（10 秒）定时器
//!    - 文档插入事件（含作者角色标记时，500ms 防抖后重新扫描）
//!    - 按钮点击（切换置顶）
//!    - 收件箱（集合推送整体替换缓存并重新渲染；应答集合查询）
//!    - 每 30 秒的上下文检查（运行时失效时降级到本地存储）
//!    - 提示过期
//! 4. 收到关闭信号后退订事件、注销上下文
//!
//! 所有错误只记录日志（必要时再给出提示），不会中断宿主页面。

use std::collections::HashSet;
use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, interval_at, sleep, sleep_until, timeout};

use crate::commands::settings::load_preferences;
use crate::dom::{Document, DomEvent, El, NodeId, Selector, SharedDocument, SubscriptionId};
use crate::models::protocol::{Request, Response};
use crate::models::settings::Preferences;
use crate::services::broadcast::{BroadcastHub, ContextId, ContextKind, Envelope};
use crate::services::identity::MessageSnapshot;
use crate::services::pin_set::PinSetManager;
use crate::services::scanner::{
    Annotator, ScanReport, TOAST_CLASS, count_buttons, count_containers, find_button,
    should_rescan,
};
use crate::services::storage::{BackendKind, LocalStore, StorageAdapter, StorageBackend};

/// 宿主就绪检查的轮询间隔
pub const HOST_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// 宿主就绪检查的最长等待时间，超时后仍然初始化
pub const HOST_READY_TIMEOUT: Duration = Duration::from_secs(10);
/// 事件循环启动后的首次扫描延迟
pub const INITIAL_SCAN_DELAY: Duration = Duration::from_secs(1);
/// 兜底扫描延迟，覆盖加载缓慢的页面
pub const FALLBACK_SCAN_DELAY: Duration = Duration::from_secs(10);
/// 插入事件的防抖延迟
pub const RESCAN_DEBOUNCE: Duration = Duration::from_millis(500);
/// 周期性上下文检查间隔
pub const CONTEXT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// 初始化失败后的重试延迟
pub const REINIT_DELAY: Duration = Duration::from_secs(2);
/// 提示显示时长
pub const TOAST_LIFETIME: Duration = Duration::from_secs(3);

/// 找不到按钮时的提示
const BUTTON_NOT_FOUND: &str = "Error: Button not found. Please try again.";

/// 宿主页面已渲染出对话的标记
static HOST_MARKERS: [Selector; 6] = [
    Selector::AttrEquals("data-testid", "conversation-turn-2"),
    Selector::AttrEquals("data-testid", "conversation-turn-3"),
    Selector::HasAttr("data-message-author-role"),
    Selector::Class("markdown"),
    Selector::Class("prose"),
    Selector::ClassContains("message"),
];

/// 会话诊断信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub buttons_found: usize,
    pub containers_found: usize,
    pub pinned_messages: usize,
    pub storage_method: BackendKind,
    pub is_initialized: bool,
}

fn lock_doc(doc: &SharedDocument) -> Result<MutexGuard<'_, Document>, String> {
    doc.lock().map_err(|e| format!("文档锁已损坏: {}", e))
}

/// 文档中是否已出现任一宿主标记
fn host_detected(doc: &SharedDocument) -> bool {
    let Ok(doc) = lock_doc(doc) else {
        return false;
    };
    HOST_MARKERS
        .iter()
        .any(|selector| doc.query_selector(doc.root(), selector).is_some())
}

/// 等待宿主页面渲染出对话
///
/// # 返回值
/// 检测到宿主标记时返回 true；等待超时返回 false
pub async fn wait_for_host_ready(doc: &SharedDocument) -> bool {
    let poll = async {
        let mut ticker = interval_at(Instant::now() + HOST_POLL_INTERVAL, HOST_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if host_detected(doc) {
                break;
            }
        }
    };

    match timeout(HOST_READY_TIMEOUT, poll).await {
        Ok(()) => {
            log::debug!("已检测到宿主页面");
            true
        }
        Err(_) => {
            log::info!("{} 秒内未检测到宿主页面标记", HOST_READY_TIMEOUT.as_secs());
            false
        }
    }
}

/// 截止时间为空时永不完成
async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// 单个宿主页面中的内容会话
pub struct ContentSession {
    doc: SharedDocument,
    url: String,
    adapter: Arc<StorageAdapter>,
    pins: PinSetManager,
    hub: Arc<BroadcastHub>,
    annotator: Annotator,
    preferences: Preferences,
    initialized: bool,
    subscription: Option<SubscriptionId>,
    dom_rx: Option<mpsc::UnboundedReceiver<DomEvent>>,
    context_id: Option<ContextId>,
    inbox: Option<mpsc::UnboundedReceiver<Envelope>>,
    /// 当前提示元素及其过期时间
    toast: Option<(NodeId, Instant)>,
}

impl ContentSession {
    /// 创建会话（尚未初始化）
    ///
    /// # 参数
    /// - `doc` - 宿主页面文档
    /// - `url` - 页面 URL，置顶记录和推送过滤都会用到
    /// - `shared` - 跨上下文共享存储；本地回退存储由会话自己持有
    /// - `hub` - 广播中心
    pub fn new(
        doc: SharedDocument,
        url: impl Into<String>,
        shared: Arc<dyn StorageBackend>,
        hub: Arc<BroadcastHub>,
    ) -> Self {
        let adapter = Arc::new(StorageAdapter::new(shared, Arc::new(LocalStore::new())));
        Self {
            doc,
            url: url.into(),
            pins: PinSetManager::new(adapter.clone()),
            adapter,
            hub,
            annotator: Annotator::new(),
            preferences: Preferences::default(),
            initialized: false,
            subscription: None,
            dom_rx: None,
            context_id: None,
            inbox: None,
            toast: None,
        }
    }

    pub fn pins(&self) -> &PinSetManager {
        &self.pins
    }

    pub fn context_id(&self) -> Option<ContextId> {
        self.context_id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// 初始化会话；已初始化时直接返回
    ///
    /// # 错误
    /// 无法订阅文档事件时返回错误
    pub async fn init(&mut self) -> Result<(), String> {
        if self.initialized {
            log::debug!("内容会话已初始化，跳过");
            return Ok(());
        }

        self.preferences = load_preferences(&*self.adapter).await.unwrap_or_else(|e| {
            log::warn!("读取偏好设置失败，使用默认值: {}", e);
            Preferences::default()
        });
        let count = self.pins.load().await;

        let (subscription, dom_rx) = lock_doc(&self.doc)?.subscribe();
        self.subscription = Some(subscription);
        self.dom_rx = Some(dom_rx);

        let (context_id, inbox) = self.hub.register(ContextKind::Tab {
            url: self.url.clone(),
        });
        self.context_id = Some(context_id);
        self.inbox = Some(inbox);

        self.initialized = true;
        log::info!(
            "内容会话已初始化：{} 条置顶消息，使用 {} 存储",
            count,
            self.adapter.active_kind()
        );
        Ok(())
    }

    /// 反复初始化直到成功
    ///
    /// # 返回值
    /// 初始化成功返回 true；等待重试期间收到关闭信号返回 false
    async fn init_with_retry(&mut self, shutdown: &mut oneshot::Receiver<()>) -> bool {
        let mut attempt = 0u32;
        loop {
            match self.init().await {
                Ok(()) => return true,
                Err(e) => {
                    attempt += 1;
                    log::error!(
                        "内容会话初始化失败（第 {} 次），{} 秒后重试: {}",
                        attempt,
                        REINIT_DELAY.as_secs(),
                        e
                    );
                    tokio::select! {
                        _ = &mut *shutdown => return false,
                        _ = sleep(REINIT_DELAY) => {}
                    }
                }
            }
        }
    }

    /// 完整生命周期：等待宿主、初始化、事件循环、清理
    pub async fn start(&mut self, mut shutdown: oneshot::Receiver<()>) {
        let ready = tokio::select! {
            _ = &mut shutdown => return,
            ready = wait_for_host_ready(&self.doc) => ready,
        };
        if !ready {
            log::info!("按兜底策略初始化内容会话");
        }

        if !self.init_with_retry(&mut shutdown).await {
            return;
        }
        self.run(&mut shutdown).await;
        self.teardown();
    }

    /// 事件循环，直到收到关闭信号
    pub async fn run(&mut self, shutdown: &mut oneshot::Receiver<()>) {
        let (Some(mut dom_rx), Some(mut inbox)) = (self.dom_rx.take(), self.inbox.take()) else {
            log::error!("内容会话尚未初始化，无法运行事件循环");
            return;
        };

        let initial_scan = sleep(INITIAL_SCAN_DELAY);
        let fallback_scan = sleep(FALLBACK_SCAN_DELAY);
        tokio::pin!(initial_scan, fallback_scan);
        let mut initial_done = false;
        let mut fallback_done = false;

        let mut context_check =
            interval_at(Instant::now() + CONTEXT_CHECK_INTERVAL, CONTEXT_CHECK_INTERVAL);
        let mut rescan_at: Option<Instant> = None;
        let mut dom_open = true;
        let mut inbox_open = true;

        loop {
            let toast_deadline = self.toast.map(|(_, at)| at);

            tokio::select! {
                _ = &mut *shutdown => break,
                _ = &mut initial_scan, if !initial_done => {
                    initial_done = true;
                    self.scan().await;
                }
                _ = &mut fallback_scan, if !fallback_done => {
                    fallback_done = true;
                    self.scan().await;
                }
                _ = sleep_until_opt(rescan_at) => {
                    rescan_at = None;
                    self.scan().await;
                }
                _ = sleep_until_opt(toast_deadline) => self.dismiss_toast(),
                _ = context_check.tick() => self.check_context().await,
                event = dom_rx.recv(), if dom_open => match event {
                    Some(DomEvent::Inserted(node)) => {
                        if rescan_at.is_none() && self.inserted_message(node) {
                            rescan_at = Some(Instant::now() + RESCAN_DEBOUNCE);
                        }
                    }
                    Some(DomEvent::Click(node)) => self.on_click(node).await,
                    None => dom_open = false,
                },
                envelope = inbox.recv(), if inbox_open => match envelope {
                    Some(envelope) => self.on_envelope(envelope).await,
                    None => inbox_open = false,
                },
            }
        }

        self.dom_rx = Some(dom_rx);
        self.inbox = Some(inbox);
    }

    /// 退订文档事件、注销上下文、移除提示
    pub fn teardown(&mut self) {
        self.dismiss_toast();
        if let Some(subscription) = self.subscription.take() {
            if let Ok(mut doc) = lock_doc(&self.doc) {
                doc.unsubscribe(subscription);
            }
        }
        if let Some(context_id) = self.context_id.take() {
            self.hub.unregister(context_id);
        }
        self.dom_rx = None;
        self.inbox = None;
        self.initialized = false;
        log::debug!("内容会话已结束");
    }

    /// 扫描文档并为新消息挂上按钮
    pub async fn scan(&mut self) -> ScanReport {
        let pinned = self.pins.pinned_ids().await;
        match lock_doc(&self.doc) {
            Ok(mut doc) => self.annotator.scan(&mut doc, &pinned),
            Err(e) => {
                log::error!("扫描失败: {}", e);
                ScanReport::default()
            }
        }
    }

    /// 移除所有按钮和容器标记后重新扫描
    pub async fn force_refresh(&mut self) -> ScanReport {
        match lock_doc(&self.doc) {
            Ok(mut doc) => {
                let removed = self.annotator.strip(&mut doc);
                log::debug!("强制刷新：移除 {} 个按钮", removed);
            }
            Err(e) => log::error!("强制刷新失败: {}", e),
        }
        self.scan().await
    }

    /// 诊断信息
    pub async fn status(&self) -> SessionStatus {
        let pinned_messages = self.pins.list().await.len();
        let (buttons_found, containers_found) = match lock_doc(&self.doc) {
            Ok(doc) => (count_buttons(&doc), count_containers(&doc)),
            Err(_) => (0, 0),
        };
        SessionStatus {
            buttons_found,
            containers_found,
            pinned_messages,
            storage_method: self.adapter.active_kind(),
            is_initialized: self.initialized,
        }
    }

    fn inserted_message(&self, node: NodeId) -> bool {
        lock_doc(&self.doc)
            .map(|doc| should_rescan(&doc, node))
            .unwrap_or(false)
    }

    async fn on_click(&mut self, node: NodeId) {
        let Some(binding) = self.annotator.binding(node).cloned() else {
            return;
        };

        let snapshot = match lock_doc(&self.doc) {
            Ok(doc) => find_button(&doc, &binding.id)
                .map(|_| MessageSnapshot::capture(&doc, binding.message)),
            Err(e) => {
                log::error!("处理点击失败: {}", e);
                return;
            }
        };
        let Some(snapshot) = snapshot else {
            log::warn!("找不到消息 {} 的按钮", binding.id);
            self.notify(BUTTON_NOT_FOUND).await;
            return;
        };

        let outcome = self.pins.toggle(&binding.id, &snapshot, &self.url).await;
        self.render_pins().await;
        self.notify(outcome.notice()).await;
    }

    async fn on_envelope(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Push(Request::PinnedMessagesUpdated { pinned_messages }) => {
                log::debug!("收到置顶集合推送：{} 条", pinned_messages.len());
                self.pins.apply_snapshot(pinned_messages).await;
                self.render_pins().await;
            }
            Envelope::Push(other) => log::debug!("忽略推送: {:?}", other),
            Envelope::Request {
                request: Request::GetPinnedMessages,
                reply,
            } => {
                let pinned_messages = self.pins.list().await;
                let _ = reply.send(Response::Pinned { pinned_messages });
            }
            Envelope::Request { request, .. } => {
                log::debug!("内容会话不处理请求: {:?}", request);
            }
        }
    }

    /// 周期性上下文检查：运行时失效时降级，并与本地存储对账
    async fn check_context(&mut self) {
        if self.adapter.check_liveness() {
            log::warn!("扩展上下文已失效，本页面改用本地存储");
            self.pins.load().await;
            self.render_pins().await;
        }
    }

    async fn render_pins(&mut self) {
        let pinned: HashSet<String> = self.pins.pinned_ids().await;
        match lock_doc(&self.doc) {
            Ok(mut doc) => {
                self.annotator.refresh(&mut doc, &pinned);
            }
            Err(e) => log::error!("刷新按钮状态失败: {}", e),
        }
    }

    /// 显示提示；同一时间最多一个，新提示替换旧提示
    async fn notify(&mut self, text: &str) {
        match load_preferences(&*self.adapter).await {
            Ok(preferences) => self.preferences = preferences,
            Err(e) => log::debug!("刷新偏好设置失败，沿用缓存: {}", e),
        }
        if !self.preferences.toast_notifications {
            log::debug!("提示已关闭: {}", text);
            return;
        }

        match lock_doc(&self.doc) {
            Ok(mut doc) => {
                if let Some((old, _)) = self.toast.take() {
                    doc.remove(old);
                }
                let parent = doc.body().unwrap_or(doc.root());
                let node = doc.insert(parent, El::new("div").class(TOAST_CLASS).text(text));
                self.toast = Some((node, Instant::now() + TOAST_LIFETIME));
            }
            Err(e) => log::error!("显示提示失败: {}", e),
        }
    }

    fn dismiss_toast(&mut self) {
        let Some((node, _)) = self.toast.take() else {
            return;
        };
        if let Ok(mut doc) = lock_doc(&self.doc) {
            doc.remove(node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::json;
    use tokio::task::JoinHandle;

    use crate::commands::settings::save_preference;
    use crate::services::pin_set::read_collection;
    use crate::services::scanner::{BUTTON_CLASS, PINNED_CLASS};
    use crate::services::storage::{RuntimeHandle, SharedStore};

    const URL: &str = "https://chatgpt.com/c/abc";

    struct Fixture {
        doc: SharedDocument,
        main: NodeId,
        runtime: RuntimeHandle,
        shared: Arc<SharedStore>,
        hub: Arc<BroadcastHub>,
    }

    fn turn(index: usize, role: &str, text: &str) -> El {
        El::new("div")
            .attr("data-testid", &format!("conversation-turn-{}", index))
            .child(
                El::new("div")
                    .attr("data-message-author-role", role)
                    .child(El::new("div").class("whitespace-pre-wrap").text(text)),
            )
    }

    fn fixture() -> Fixture {
        let mut doc = Document::with_body();
        let body = doc.body().unwrap();
        let main = doc.insert(body, El::new("main"));
        doc.insert(main, turn(2, "user", "Hello world"));
        doc.insert(main, turn(3, "assistant", "Hi there"));

        let runtime = RuntimeHandle::new();
        Fixture {
            doc: Arc::new(Mutex::new(doc)),
            main,
            shared: Arc::new(SharedStore::in_memory(runtime.clone())),
            runtime,
            hub: Arc::new(BroadcastHub::new()),
        }
    }

    fn session(f: &Fixture) -> ContentSession {
        ContentSession::new(f.doc.clone(), URL, f.shared.clone(), f.hub.clone())
    }

    fn spawn(mut session: ContentSession) -> (oneshot::Sender<()>, JoinHandle<ContentSession>) {
        let (stop, mut shutdown) = oneshot::channel();
        let task = tokio::spawn(async move {
            session.run(&mut shutdown).await;
            session
        });
        (stop, task)
    }

    fn buttons(doc: &SharedDocument) -> Vec<NodeId> {
        let doc = doc.lock().unwrap();
        doc.query_selector_all(doc.root(), &Selector::Class(BUTTON_CLASS))
    }

    fn toast_text(doc: &SharedDocument) -> Option<String> {
        let doc = doc.lock().unwrap();
        doc.query_selector(doc.root(), &Selector::Class(TOAST_CLASS))
            .map(|t| doc.text_content(t))
    }

    fn click(doc: &SharedDocument, node: NodeId) {
        doc.lock().unwrap().click(node);
    }

    fn is_pinned(doc: &SharedDocument, button: NodeId) -> bool {
        doc.lock().unwrap().has_class(button, PINNED_CLASS)
    }

    async fn settle() {
        sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn click_pins_and_toast_expires() {
        let f = fixture();
        let mut s = session(&f);
        s.init().await.unwrap();
        let (stop, task) = spawn(s);

        sleep(Duration::from_millis(1100)).await;
        let found = buttons(&f.doc);
        assert_eq!(found.len(), 2);

        click(&f.doc, found[0]);
        settle().await;
        assert!(is_pinned(&f.doc, found[0]));
        assert!(!is_pinned(&f.doc, found[1]));
        assert_eq!(toast_text(&f.doc).as_deref(), Some("Message pinned!"));

        let stored = read_collection(&*f.shared).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "Hello world");
        assert_eq!(stored[0].author, "User");
        assert_eq!(stored[0].url, URL);

        sleep(TOAST_LIFETIME + Duration::from_millis(100)).await;
        assert_eq!(toast_text(&f.doc), None);

        click(&f.doc, found[0]);
        settle().await;
        assert!(!is_pinned(&f.doc, found[0]));
        assert_eq!(toast_text(&f.doc).as_deref(), Some("Message unpinned"));

        stop.send(()).unwrap();
        let s = task.await.unwrap();
        assert_eq!(s.status().await.pinned_messages, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn inserted_turns_are_scanned_after_debounce() {
        let f = fixture();
        let mut s = session(&f);
        s.init().await.unwrap();
        let (stop, task) = spawn(s);

        sleep(Duration::from_millis(1100)).await;
        assert_eq!(buttons(&f.doc).len(), 2);

        f.doc.lock().unwrap().insert(f.main, turn(4, "user", "Another question"));
        sleep(Duration::from_millis(300)).await;
        assert_eq!(buttons(&f.doc).len(), 2);
        sleep(Duration::from_millis(300)).await;
        assert_eq!(buttons(&f.doc).len(), 3);

        // 兜底扫描不会重复标注
        sleep(FALLBACK_SCAN_DELAY).await;
        assert_eq!(buttons(&f.doc).len(), 3);

        stop.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn pushed_snapshot_replaces_state() {
        let f = fixture();
        let mut s = session(&f);
        s.init().await.unwrap();
        let context = s.context_id().unwrap();
        let (stop, task) = spawn(s);

        sleep(Duration::from_millis(1100)).await;
        let found = buttons(&f.doc);
        click(&f.doc, found[1]);
        settle().await;
        assert!(is_pinned(&f.doc, found[1]));

        match f.hub.request(context, Request::GetPinnedMessages).await.unwrap() {
            Response::Pinned { pinned_messages } => assert_eq!(pinned_messages.len(), 1),
            other => panic!("unexpected response: {:?}", other),
        }

        assert_eq!(f.hub.publish(&[], None), 1);
        settle().await;
        assert!(!is_pinned(&f.doc, found[1]));

        stop.send(()).unwrap();
        let s = task.await.unwrap();
        assert!(s.pins().list().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn context_loss_demotes_to_local_storage() {
        let f = fixture();
        let mut s = session(&f);
        s.init().await.unwrap();
        let (stop, task) = spawn(s);

        sleep(Duration::from_millis(1100)).await;
        let found = buttons(&f.doc);
        click(&f.doc, found[0]);
        settle().await;

        f.runtime.invalidate();
        sleep(CONTEXT_CHECK_INTERVAL).await;

        click(&f.doc, found[1]);
        settle().await;
        assert!(is_pinned(&f.doc, found[0]));
        assert!(is_pinned(&f.doc, found[1]));
        assert_eq!(toast_text(&f.doc).as_deref(), Some("Message pinned!"));

        stop.send(()).unwrap();
        let s = task.await.unwrap();
        let status = s.status().await;
        assert_eq!(status.storage_method, BackendKind::Local);
        assert_eq!(status.pinned_messages, 2);

        f.runtime.restore();
        assert_eq!(read_collection(&*f.shared).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn toasts_follow_preference() {
        let f = fixture();
        save_preference(&*f.shared, "toastNotifications", json!(false))
            .await
            .unwrap();
        let mut s = session(&f);
        s.init().await.unwrap();
        let (stop, task) = spawn(s);

        sleep(Duration::from_millis(1100)).await;
        click(&f.doc, buttons(&f.doc)[0]);
        settle().await;
        assert_eq!(toast_text(&f.doc), None);
        assert_eq!(read_collection(&*f.shared).await.unwrap().len(), 1);

        stop.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn detached_button_reports_error() {
        let f = fixture();
        let mut s = session(&f);
        s.init().await.unwrap();
        let (stop, task) = spawn(s);

        sleep(Duration::from_millis(1100)).await;
        let button = buttons(&f.doc)[0];
        f.doc.lock().unwrap().remove(button);
        click(&f.doc, button);
        settle().await;

        assert_eq!(toast_text(&f.doc).as_deref(), Some(BUTTON_NOT_FOUND));
        assert!(read_collection(&*f.shared).await.unwrap().is_empty());

        stop.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn init_is_idempotent_and_force_refresh_rebuilds() {
        let f = fixture();
        let mut s = session(&f);
        s.init().await.unwrap();
        s.init().await.unwrap();
        assert_eq!(f.hub.context_count(), 1);
        assert_eq!(f.doc.lock().unwrap().subscriber_count(), 1);

        assert_eq!(s.scan().await.buttons_added, 2);
        assert_eq!(s.scan().await.buttons_added, 0);
        assert_eq!(s.force_refresh().await.buttons_added, 2);

        let status = s.status().await;
        assert_eq!(status.buttons_found, 2);
        assert_eq!(status.containers_found, 2);
        assert!(status.is_initialized);
        assert_eq!(status.storage_method, BackendKind::Shared);

        s.teardown();
        assert_eq!(f.hub.context_count(), 0);
        assert_eq!(f.doc.lock().unwrap().subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn host_ready_detection() {
        let empty: SharedDocument = Arc::new(Mutex::new(Document::with_body()));
        let started = Instant::now();
        assert!(!wait_for_host_ready(&empty).await);
        assert!(started.elapsed() >= HOST_READY_TIMEOUT);

        let f = fixture();
        let started = Instant::now();
        assert!(wait_for_host_ready(&f.doc).await);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn start_runs_until_shutdown() {
        let f = fixture();
        let mut s = session(&f);
        let (stop, shutdown) = oneshot::channel();
        let task = tokio::spawn(async move {
            s.start(shutdown).await;
            s
        });

        sleep(Duration::from_secs(3)).await;
        assert_eq!(f.hub.context_count(), 1);
        assert_eq!(buttons(&f.doc).len(), 2);

        stop.send(()).unwrap();
        let s = task.await.unwrap();
        assert!(!s.is_initialized());
        assert_eq!(f.hub.context_count(), 0);
    }
}
