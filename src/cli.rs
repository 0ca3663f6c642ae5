//! # 命令行入口
//!
//! 无界面的面板上下文：直接操作文件持久化的共享存储。
//!
//! ```text
//! chat-pinner list
//! chat-pinner remove <ID>
//! chat-pinner export [--dir D]
//! chat-pinner clear
//! chat-pinner prefs show | reset | set <KEY> <VALUE>
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::commands::background::BackgroundRouter;
use crate::services::broadcast::BroadcastHub;
use crate::services::storage::{RuntimeHandle, SharedStore};
use crate::session::panel::{ExportOutcome, PanelSession};
use crate::utils::path;

#[derive(Debug, Parser)]
#[command(name = "chat-pinner")]
#[command(about = "Browse and manage pinned chat messages")]
pub struct Cli {
    /// Data directory holding storage.json (defaults to ~/.chatgpt-pinner)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List pinned messages, newest first
    List,
    /// Remove a pinned message by id
    Remove { id: String },
    /// Export all pinned messages as a dated JSON file
    Export {
        /// Target directory (defaults to the download directory)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Clear all pinned messages and settings
    Clear,
    /// Show or change preferences
    Prefs {
        #[command(subcommand)]
        action: PrefsAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum PrefsAction {
    /// Print current preferences
    Show,
    /// Restore default preferences
    Reset,
    /// Set one preference; VALUE is parsed as JSON, otherwise taken as text
    Set { key: String, value: String },
}

/// 命令行参数中的值：能按 JSON 解析就按 JSON，否则当作字符串
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// 导出文件名中的日期，按 UTC 计算
fn export_date() -> NaiveDate {
    Utc::now().date_naive()
}

/// 执行一条命令
///
/// # 返回值
/// 需要输出到终端的行
///
/// # 错误
/// 存储打开、读写或导出失败时返回错误
pub async fn execute(cli: Cli) -> Result<Vec<String>, String> {
    let storage_file = match cli.data_dir {
        Some(dir) => dir.join("storage.json"),
        None => path::get_storage_file_path()?,
    };
    log::debug!("使用存储文件 {}", storage_file.display());

    let shared = Arc::new(SharedStore::open(&storage_file, RuntimeHandle::new()).await?);
    let hub = Arc::new(BroadcastHub::new());
    BackgroundRouter::new(shared.clone(), hub.clone())
        .install()
        .await?;

    let mut panel = PanelSession::open(shared, hub).await;
    let result = run_command(&mut panel, cli.command).await;
    panel.close();
    result
}

async fn run_command(panel: &mut PanelSession, command: Command) -> Result<Vec<String>, String> {
    let mut out = Vec::new();
    match command {
        Command::List => {
            let cards = panel.cards(Utc::now()).await;
            if cards.is_empty() {
                out.push("No pinned messages yet".to_string());
            }
            for card in cards {
                out.push(format!(
                    "{}  [{}] {}  {}",
                    card.time_label, card.author, card.id, card.preview
                ));
            }
        }
        Command::Remove { id } => {
            let before = panel.messages().await.len();
            let remaining = panel.remove(&id).await?;
            if remaining.len() == before {
                out.push(format!("No pinned message with id {}", id));
            } else {
                out.push("Message removed from pinned".to_string());
            }
        }
        Command::Export { dir } => {
            let dir = match dir {
                Some(dir) => dir,
                None => path::get_export_dir()?,
            };
            match panel.export(&dir, export_date()).await? {
                ExportOutcome::Written { path, count } => {
                    out.push(format!(
                        "Exported {} pinned messages to {}",
                        count,
                        path.display()
                    ));
                }
                ExportOutcome::NothingToExport => {
                    out.push("No pinned messages to export".to_string());
                }
            }
        }
        Command::Clear => {
            panel.clear_all_data().await?;
            out.push("All data cleared successfully".to_string());
        }
        Command::Prefs { action } => {
            match action {
                PrefsAction::Show => {}
                PrefsAction::Reset => {
                    panel.reset_settings().await?;
                    out.push("Settings reset to defaults".to_string());
                }
                PrefsAction::Set { key, value } => {
                    panel.set_preference(&key, parse_value(&value)).await?;
                }
            }
            let shown = serde_json::to_string_pretty(panel.preferences())
                .map_err(|e| format!("序列化偏好设置失败: {}", e))?;
            out.push(shown);
        }
    }
    Ok(out)
}
