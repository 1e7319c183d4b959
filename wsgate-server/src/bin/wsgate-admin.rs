//! Project administration for wsgate.
//!
//! Usage:
//!   wsgate-admin --db wsgate.db create-project acme
//!   wsgate-admin add-domain acme '*.acme.com'
//!   wsgate-admin add-domain acme beta.acme.com --deny
//!   wsgate-admin list
//!   wsgate-admin mint-token acme --id user-1 --claim sendable=false --ttl-secs 3600

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::{Map, Value};

use wsgate_server::db::Db;
use wsgate_server::project::RuleKind;
use wsgate_server::token;

#[derive(Parser)]
#[command(name = "wsgate-admin", about = "Manage wsgate projects")]
struct Args {
    /// SQLite project database.
    #[arg(long, env = "WSGATE_DB", default_value = "wsgate.db")]
    db: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a project and print its secret.
    CreateProject {
        name: String,
        #[arg(long)]
        allow_any_domain: bool,
        #[arg(long)]
        description: Option<String>,
    },
    /// Add an allow (or, with --deny, deny) domain rule.
    AddDomain {
        project: String,
        pattern: String,
        #[arg(long)]
        deny: bool,
    },
    RemoveDomain {
        project: String,
        pattern: String,
        #[arg(long)]
        deny: bool,
    },
    /// Accept connections from any origin not explicitly denied.
    AllowAnyDomain {
        project: String,
        #[arg(action = ArgAction::Set)]
        allow: bool,
    },
    /// Replace the signing secret; tokens signed with the old one stop working.
    RotateSecret { project: String },
    Show { project: String },
    /// List project names.
    List,
    /// Delete a project and its domain rules.
    DeleteProject { project: String },
    /// Sign a connection token with the project's secret.
    MintToken {
        project: String,
        #[arg(long)]
        id: String,
        /// Extra claim as key=value; the value is parsed as JSON, else taken as a string.
        #[arg(long = "claim")]
        claims: Vec<String>,
        #[arg(long)]
        ttl_secs: Option<i64>,
    },
}

fn rule_kind(deny: bool) -> RuleKind {
    if deny { RuleKind::Deny } else { RuleKind::Allow }
}

fn parse_claim(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("claim '{raw}' is not key=value"))?;
    if key.is_empty() {
        bail!("claim '{raw}' has an empty key");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn main() -> Result<()> {
    let args = Args::parse();
    let db = Db::open(&args.db).with_context(|| format!("opening {}", args.db))?;

    match args.command {
        Command::CreateProject { name, allow_any_domain, description } => {
            let project = db.create_project(&name, allow_any_domain, description.as_deref())?;
            println!("project: {}", project.name);
            println!("secret:  {}", project.secret);
        }
        Command::AddDomain { project, pattern, deny } => {
            let rule = db.add_domain_rule(&project, &pattern, rule_kind(deny))?;
            println!("{} {}", rule.kind, rule.pattern);
        }
        Command::RemoveDomain { project, pattern, deny } => {
            if !db.remove_domain_rule(&project, &pattern, rule_kind(deny))? {
                bail!("no such rule");
            }
        }
        Command::AllowAnyDomain { project, allow } => {
            db.set_allow_any_domain(&project, allow)?;
        }
        Command::RotateSecret { project } => {
            println!("{}", db.rotate_secret(&project)?);
        }
        Command::Show { project } => {
            let p = db
                .get_project(&project)?
                .with_context(|| format!("no project named '{project}'"))?;
            println!("project:          {}", p.name);
            println!("allow any domain: {}", p.allow_any_domain);
            for rule in &p.rules {
                println!("  {:<5} {}", rule.kind.as_str(), rule.pattern);
            }
        }
        Command::List => {
            for name in db.list_projects()? {
                println!("{name}");
            }
        }
        Command::DeleteProject { project } => {
            if !db.delete_project(&project)? {
                bail!("no project named '{project}'");
            }
        }
        Command::MintToken { project, id, claims, ttl_secs } => {
            let p = db
                .get_project(&project)?
                .with_context(|| format!("no project named '{project}'"))?;
            let mut payload = Map::new();
            for raw in &claims {
                let (key, value) = parse_claim(raw)?;
                payload.insert(key, value);
            }
            payload.insert(token::IDENTITY_CLAIM.to_string(), Value::String(id));
            if let Some(ttl) = ttl_secs {
                payload.insert("exp".into(), Value::from(chrono::Utc::now().timestamp() + ttl));
            }
            println!("{}", token::sign(&Value::Object(payload), &p.secret)?);
        }
    }
    Ok(())
}
