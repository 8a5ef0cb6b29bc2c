use crate::{
    api::{AuthApi, Credentials},
    context::SessionContext,
    guard::{GuardAction, SessionState},
    nav::{self, Navigator, Route, ShellNavigator, DRAWER},
};
use anyhow::{anyhow, Result};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::sync::Arc;
use tracing::debug;

pub struct Context {
    pub api_host: String,
    pub session: SessionContext,
    pub api: Arc<dyn AuthApi>,
    pub navigator: Arc<ShellNavigator>,
}

/// A parsed shell command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Exit,
    Help,
    Login {
        username: String,
        password: Option<String>,
    },
    Logout,
    Status,
    Check,
    Menu,
    Go(Route),
    Forgot(String),
}

impl Command {
    /// Command name without arguments, safe to log
    pub fn name(&self) -> &'static str {
        match self {
            Self::Exit => "exit",
            Self::Help => "help",
            Self::Login { .. } => "login",
            Self::Logout => "logout",
            Self::Status => "status",
            Self::Check => "check",
            Self::Menu => "menu",
            Self::Go(_) => "go",
            Self::Forgot(_) => "forgot",
        }
    }

    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let line = line.strip_prefix('/').unwrap_or(line);
        let mut parts = line.split_whitespace();
        let name = parts.next().unwrap_or_default();
        let rest: Vec<&str> = parts.collect();

        match (name, rest.as_slice()) {
            ("exit" | "quit", []) => Ok(Self::Exit),
            ("help", []) => Ok(Self::Help),
            ("login", [username]) => Ok(Self::Login {
                username: username.to_string(),
                password: None,
            }),
            ("login", [username, password]) => Ok(Self::Login {
                username: username.to_string(),
                password: Some(password.to_string()),
            }),
            ("login", _) => Err("Usage: /login <username> [password]".to_string()),
            ("logout", []) => Ok(Self::Logout),
            ("status", []) => Ok(Self::Status),
            ("check", []) => Ok(Self::Check),
            ("menu", []) => Ok(Self::Menu),
            ("go", [page]) => Route::parse(page)
                .map(Self::Go)
                .ok_or_else(|| format!("Unknown page: {}. See /menu", page)),
            ("go", _) => Err("Usage: /go <page>".to_string()),
            ("forgot", [email]) => Ok(Self::Forgot(email.to_string())),
            ("forgot", _) => Err("Usage: /forgot <email>".to_string()),
            ("", _) => Err("Empty command".to_string()),
            (other, _) => Err(format!("Unknown command: /{}. Type /help", other)),
        }
    }
}

pub fn run_once(ctx: &Context, line: &str) -> Result<()> {
    let command = Command::parse(line).map_err(|e| anyhow!(e))?;
    if let Command::Login { password: None, .. } = command {
        return Err(anyhow!("One-shot login needs the password: login <username> <password>"));
    }
    execute(ctx, command, &mut |_: &str| None)?;
    Ok(())
}

pub fn run_repl(ctx: Context) -> Result<()> {
    let mut rl = DefaultEditor::new()?;

    println!("medadmin - type /help for commands, /exit to quit");
    show_landing(&ctx);

    loop {
        let prompt = format!("{}> ", ctx.navigator.current());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let command = match Command::parse(line) {
                    Ok(command) => command,
                    Err(e) => {
                        println!("{}", e);
                        continue;
                    }
                };
                // Keep passwords out of the history file.
                if !matches!(command, Command::Login { password: Some(_), .. }) {
                    rl.add_history_entry(line)?;
                }

                let mut ask = |label: &str| rl.readline(label).ok();
                match execute(&ctx, command, &mut ask) {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Input error: {}", e);
                break;
            }
        }
    }

    ctx.session.shutdown();
    Ok(())
}

fn show_landing(ctx: &Context) {
    let authenticated = ctx.session.store().is_authenticated();
    ctx.navigator
        .navigate(nav::resolve(Route::Dashboard, authenticated));
    if !authenticated {
        println!("Not logged in. Use /login <username>");
    }
}

/// Run one command. Returns true when the shell should exit.
pub fn execute(
    ctx: &Context,
    command: Command,
    ask: &mut dyn FnMut(&str) -> Option<String>,
) -> Result<bool> {
    debug!(command = command.name(), "execute");
    let store = ctx.session.store();

    match command {
        Command::Exit => return Ok(true),
        Command::Help => print_help(),
        Command::Login { username, password } => {
            let password = match password.or_else(|| ask("password: ")) {
                Some(p) => p,
                None => return Err(anyhow!("Login cancelled")),
            };
            let token = ctx.api.login(&Credentials { username, password })?;
            let user = token.user_id.clone();
            store.login(token);
            ctx.navigator.navigate(Route::Dashboard);
            println!("Logged in as {}", user);
        }
        Command::Logout => {
            store.logout(true);
            ctx.navigator.navigate(Route::Login);
            println!("Logged out");
        }
        Command::Status => print_status(ctx),
        Command::Check => {
            let action = ctx.session.guard().recheck();
            println!("{}", describe_action(action));
        }
        Command::Menu => print_menu(ctx),
        Command::Go(route) => {
            let target = nav::resolve(route, store.is_authenticated());
            if target != route {
                println!("{} requires login", route);
            }
            ctx.navigator.navigate(target);
            println!("Now at {}", target);
        }
        Command::Forgot(email) => {
            ctx.api.forget_password(&email)?;
            println!("Password reset requested for {}", email);
        }
    }
    Ok(false)
}

pub fn describe_action(action: GuardAction) -> &'static str {
    match action {
        GuardAction::None => "Session unchanged",
        GuardAction::Refreshed => "Token refreshed",
        GuardAction::RefreshDeferred => "Refresh failed, will retry",
        GuardAction::LoggedOut => "Session ended",
        GuardAction::Busy => "Refresh already in progress",
    }
}

fn print_help() {
    println!("Commands:");
    println!("  /exit                       - quit");
    println!("  /help                       - show commands");
    println!("Session:");
    println!("  /login <user> [password]    - log in (prompts for password)");
    println!("  /logout                     - log out");
    println!("  /status                     - show session state and expiry");
    println!("  /check                      - run the session check now");
    println!("  /forgot <email>             - request a password reset");
    println!("Navigation:");
    println!("  /menu                       - show the drawer menu");
    println!("  /go <page>                  - open a page (e.g. /go doctors)");
}

fn print_status(ctx: &Context) {
    let guard = ctx.session.guard();
    let session = ctx.session.store().snapshot();
    let state = guard.state();

    println!("State: {}", state.as_str());
    println!("Page: {}", ctx.navigator.current());
    if let Some(token) = session.token() {
        println!("User: {}", token.user_id);
        let remaining = token.remaining_secs(guard.now());
        println!(
            "Expires: {} ({})",
            token.expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
            format_remaining(remaining)
        );
    }
    if state == SessionState::RefreshWindow {
        println!("Token will be refreshed on the next check");
    }
    println!("Backend: {}", ctx.api_host);
}

fn print_menu(ctx: &Context) {
    if !ctx.session.store().is_authenticated() {
        println!("Log in to see the menu");
        return;
    }
    let current = ctx.navigator.current();
    for section in DRAWER {
        println!("{}", section.label);
        for item in section.items {
            let marker = if item.route == current { " *" } else { "" };
            println!("  {:<14} {}{}", item.label, item.route, marker);
        }
    }
    println!("Logout");
}

pub fn format_remaining(secs: i64) -> String {
    if secs <= 0 {
        return "expired".to_string();
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("in {}h{:02}m", h, m)
    } else if m > 0 {
        format!("in {}m{:02}s", m, s)
    } else {
        format!("in {}s", s)
    }
}
