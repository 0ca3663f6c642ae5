//! # Chat Pinner - 核心初始化模块
//!
//! 在聊天页面的消息旁挂载置顶按钮，把置顶的消息保存到跨上下文共享的
//! 键值存储中，并在所有打开的宿主标签之间保持一致。
//!
//! ## 模块结构
//! - `cli` - 命令行入口（无界面的面板上下文）
//! - `commands/` - 后台请求路由和偏好设置命令
//! - `dom/` - 文档树模型、选择器和变更事件
//! - `models/` - 数据模型（置顶消息、偏好设置、消息协议）
//! - `services/` - 核心业务逻辑（身份推导、扫描标注、置顶集合、存储、广播、导出）
//! - `session/` - 页面注入会话和面板会话
//! - `utils/` - 通用工具函数（路径、时间）

pub mod cli;
pub mod commands;
pub mod dom;
pub mod models;
pub mod services;
pub mod session;
pub mod utils;

use clap::Parser;

/// 应用启动函数
///
/// 1. 初始化日志（默认级别 `info`，可通过 `RUST_LOG` 覆盖）
/// 2. 解析命令行参数
/// 3. 在单线程 tokio 运行时中执行命令并输出结果
///
/// 任何一步失败都以退出码 1 结束进程。
pub fn run() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = cli::Cli::parse();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("创建异步运行时失败: {}", e);
            std::process::exit(1);
        }
    };

    match runtime.block_on(cli::execute(args)) {
        Ok(lines) => {
            for line in lines {
                println!("{}", line);
            }
        }
        Err(e) => {
            log::error!("命令执行失败: {}", e);
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
