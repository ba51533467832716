//! Turn an English schedule description into a cron trigger
//!
//! Usage:
//!   vigil-cron "every weekday at 6:30"            (ask the cron model)
//!   vigil-cron --check "30 6 * * 1-5" [--count N] (validate and preview)

use anyhow::Result;
use chrono::Utc;
use vigil_core::config::Config;
use vigil_core::trigger::{format_local, generate_cron_expression, next_fire_after};
use vigil_core::OpenAiCompatClient;

fn usage() -> ! {
    eprintln!("Usage: vigil-cron <description> | --check <expression> [--count N]");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args: Vec<String> = std::env::args().skip(1).collect();

    let count = args
        .iter()
        .position(|a| a == "--count")
        .and_then(|i| args.get(i + 1))
        .map(|n| n.parse::<usize>())
        .transpose()
        .map_err(|e| anyhow::anyhow!("--count must be a number: {}", e))?
        .unwrap_or(3);

    let positional: Vec<&String> = args
        .iter()
        .enumerate()
        .filter(|(i, a)| !a.starts_with("--") && (*i == 0 || args[*i - 1] != "--count"))
        .map(|(_, a)| a)
        .collect();
    let Some(input) = positional.first() else {
        usage();
    };

    // The agent database is not needed here
    let config = Config::from_lookup(|name| {
        std::env::var(name)
            .ok()
            .or_else(|| (name == "DATABASE_URL").then(String::new))
    })?;
    let expression = if args.iter().any(|a| a == "--check") {
        input.to_string()
    } else {
        let client = OpenAiCompatClient::new(config.models.clone())?;
        generate_cron_expression(&client, &config.cron_model(), input).await?
    };

    println!("{}", expression);

    let mut from = Utc::now();
    for _ in 0..count {
        let next = next_fire_after(&expression, from)?;
        println!(
            "  {}  ({})",
            next.to_rfc3339(),
            format_local(next, config.scheduler.display_timezone)
        );
        from = next;
    }

    Ok(())
}
