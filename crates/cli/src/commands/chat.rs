//! `opsclaw chat`: Interactive or single-message chat.
//!
//! Progress events are printed to stderr as an indented tree while the
//! request runs. Operations that need confirmation are offered for
//! confirmation interactively, or listed with their handles.

use anyhow::Context;
use clap::Args;
use opsclaw_agent::progress::{self, ProgressReceiver};
use opsclaw_agent::{Assistant, AssistantRequest, AssistantResponse, ProgressEventKind, StreamItem};
use opsclaw_core::operation::Caller;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Args, Debug, Clone, Default)]
pub struct ChatArgs {
    /// Send a single message instead of entering interactive mode
    #[arg(short, long)]
    pub message: Option<String>,

    /// Continue an existing conversation
    #[arg(long)]
    pub conversation: Option<String>,

    /// Response style: technical, casual, brief, verbose
    #[arg(long)]
    pub mode: Option<String>,

    /// Acting user id
    #[arg(long, env = "OPSCLAW_USER")]
    pub user: Option<String>,

    /// Roles of the acting user (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub roles: Vec<String>,

    /// Confirm every pending operation without asking
    #[arg(long)]
    pub yes: bool,

    /// Hide the progress tree
    #[arg(long)]
    pub quiet: bool,
}

impl ChatArgs {
    fn caller(&self) -> Caller {
        let caller = match &self.user {
            Some(user) => Caller::user(user),
            None => Caller::anonymous(),
        };
        caller.with_roles(self.roles.clone())
    }
}

pub async fn run(config_path: Option<&Path>, args: ChatArgs) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    if !config.has_api_key() {
        eprintln!("  No API key configured; replies come from the offline mock backend.");
        eprintln!("  Set OPSCLAW_API_KEY or OPENAI_API_KEY, or add api_key to:");
        eprintln!("    {}", opsclaw_config::AppConfig::config_dir().join("config.toml").display());
        eprintln!();
    }
    let assistant = Assistant::from_config(&config)
        .await
        .context("Failed to start the assistant")?;
    let caller = args.caller();

    if let Some(message) = args.message.clone() {
        let request = build_request(&args, args.conversation.clone(), message, caller.clone());
        let response = send(&assistant, request, args.quiet).await?;
        print_response(&response);
        if args.yes {
            confirm_all(&assistant, &response, &caller).await;
        } else {
            for pending in &response.pending_confirmations {
                println!(
                    "  Pending: {} ({}) — confirm via POST /v1/actions/confirm",
                    pending.operation, pending.confirmation_id
                );
            }
        }
        return Ok(());
    }

    println!();
    println!("  OpsClaw — Interactive Mode");
    println!();
    println!("  Provider:    {}", assistant.provider_name());
    println!("  Model:       {}", assistant.settings().model);
    println!("  Operations:  {}", assistant.catalog().len());
    println!();
    println!("  Type your message and press Enter.");
    println!("  Type 'exit' or Ctrl+C to quit.");
    println!();

    let mut conversation = args.conversation.clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt()?;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            prompt()?;
            continue;
        }
        if matches!(line.as_str(), "exit" | "quit") {
            break;
        }

        let request = build_request(&args, conversation.clone(), line, caller.clone());
        match send(&assistant, request, args.quiet).await {
            Ok(response) => {
                conversation = Some(response.conversation_id.clone());
                print_response(&response);
                if args.yes {
                    confirm_all(&assistant, &response, &caller).await;
                } else {
                    for pending in &response.pending_confirmations {
                        print!("  Confirm '{}'? [y/N] ", pending.operation);
                        std::io::stdout().flush()?;
                        let answer = lines.next_line().await?.unwrap_or_default();
                        if answer.trim().eq_ignore_ascii_case("y") {
                            let outcome = assistant.confirm(&pending.confirmation_id, &caller).await;
                            println!("  [{}] {}", status_label(outcome.success), outcome.message);
                        } else {
                            assistant.cancel(&pending.confirmation_id);
                            println!("  Cancelled.");
                        }
                    }
                }
            }
            Err(e) => eprintln!("  [Error] {e:#}"),
        }
        println!();
        prompt()?;
    }

    println!();
    println!("  Goodbye!");
    Ok(())
}

fn build_request(args: &ChatArgs, conversation: Option<String>, message: String, caller: Caller) -> AssistantRequest {
    AssistantRequest {
        conversation_id: conversation,
        message,
        caller,
        mode: args.mode.clone(),
        ..Default::default()
    }
}

fn prompt() -> std::io::Result<()> {
    print!("  You > ");
    std::io::stdout().flush()
}

/// Run one request while printing its progress tree.
async fn send(assistant: &Assistant, request: AssistantRequest, quiet: bool) -> anyhow::Result<AssistantResponse> {
    let conversation_id = request
        .conversation_id
        .clone()
        .unwrap_or_else(|| opsclaw_core::ConversationId::new().to_string());
    let request = AssistantRequest {
        conversation_id: Some(conversation_id.clone()),
        ..request
    };
    let (emitter, receiver) = progress::channel(conversation_id, &assistant.settings().progress);

    let (result, ()) = tokio::join!(
        assistant.handle_with_progress(request, &emitter),
        print_progress(receiver, quiet)
    );
    Ok(result?)
}

async fn print_progress(mut receiver: ProgressReceiver, quiet: bool) {
    let mut depth: HashMap<String, usize> = HashMap::new();
    while let Some(item) = receiver.next().await {
        let StreamItem::Event(event) = item else { continue };
        if quiet {
            continue;
        }
        let Some(task) = &event.task else { continue };
        let level = match event.event {
            ProgressEventKind::Start => {
                let level = task
                    .parent_id
                    .as_ref()
                    .and_then(|p| depth.get(p))
                    .map_or(0, |d| d + 1);
                depth.insert(task.id.clone(), level);
                level
            }
            _ => depth.get(&task.id).copied().unwrap_or(0),
        };
        let indent = "  ".repeat(level + 1);
        match event.event {
            ProgressEventKind::Start => eprintln!("{indent}… {}", task.title),
            ProgressEventKind::Update => {
                if let Some(detail) = &task.detail {
                    eprintln!("{indent}  {detail}");
                }
            }
            ProgressEventKind::Done => {
                eprintln!("{indent}✓ {}", task.summary.as_deref().unwrap_or(&task.title))
            }
            ProgressEventKind::Error => {
                eprintln!("{indent}✗ {}", task.summary.as_deref().unwrap_or(&task.title))
            }
            ProgressEventKind::Chunk | ProgressEventKind::DoneFinal => {}
        }
    }
}

fn print_response(response: &AssistantResponse) {
    println!();
    for line in response.content.lines() {
        println!("  Assistant > {line}");
    }
    for action in &response.actions {
        println!(
            "  [{}] {} — {}",
            status_label(action.outcome.success),
            action.call.name,
            action.outcome.message
        );
    }
}

async fn confirm_all(assistant: &Assistant, response: &AssistantResponse, caller: &Caller) {
    for pending in &response.pending_confirmations {
        let outcome = assistant.confirm(&pending.confirmation_id, caller).await;
        println!("  [{}] {} — {}", status_label(outcome.success), pending.operation, outcome.message);
    }
}

fn status_label(success: bool) -> &'static str {
    if success { "ok" } else { "failed" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_from_args() {
        let args = ChatArgs {
            user: Some("alice".into()),
            roles: vec!["admin".into()],
            ..Default::default()
        };
        let caller = args.caller();
        assert_eq!(caller.user_id.as_deref(), Some("alice"));
        assert_eq!(caller.roles, vec!["admin"]);

        assert!(ChatArgs::default().caller().user_id.is_none());
    }

    #[test]
    fn request_carries_mode_and_conversation() {
        let args = ChatArgs {
            mode: Some("brief".into()),
            ..Default::default()
        };
        let request = build_request(&args, Some("c1".into()), "hi".into(), Caller::anonymous());
        assert_eq!(request.conversation_id.as_deref(), Some("c1"));
        assert_eq!(request.mode.as_deref(), Some("brief"));
        assert_eq!(request.message, "hi");
    }
}
