//! # Chat Pinner - 命令行入口点
//!
//! `main.rs` 仅负责启动应用，核心逻辑位于 `lib.rs` 中。

/// 应用程序主入口函数
///
/// 调用 `pinner_lib::run()` 完成日志初始化、参数解析和命令执行。
fn main() {
    pinner_lib::run();
}
