use clap::ValueEnum;
use colored::Colorize;

use crate::dispatch::Response;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Json,
    Pretty,
}

/// Print one dispatcher response in the selected format.
pub fn print_response(response: &Response, format: Format) {
    match format {
        Format::Json => {
            let record = serde_json::json!({
                "text": response.text,
                "details": response.details,
            });
            println!("{record}");
        }
        Format::Pretty => {
            if response.is_error() {
                eprintln!("{}", response.text.red());
            } else if response.text.starts_with("Warning:") {
                println!("{}", response.text.yellow());
            } else {
                println!("{}", response.text.green());
            }
            if let Some(agents) = response.details.get("agents").and_then(|v| v.as_array()) {
                for agent in agents {
                    let name = agent["name"].as_str().unwrap_or("?");
                    let status = agent["status"].as_str().unwrap_or("-");
                    let message = agent["statusMessage"].as_str().unwrap_or("");
                    println!("  {} [{}] {}", name.bold(), status, message.dimmed());
                }
            }
            if let Some(events) = response.details.get("events").and_then(|v| v.as_array()) {
                for event in events {
                    let agent = event["agent"].as_str().unwrap_or("?");
                    let kind = event["type"].as_str().unwrap_or("-");
                    let preview = event["preview"].as_str().unwrap_or("");
                    println!("  {} {} {}", agent.bold(), kind, preview.dimmed());
                }
            }
        }
    }
}
