//! Minimal generation example.
//!
//! Sends one requirement with an inline context document, validates each
//! candidate with `oso-cloud validate`, and prints the final policy with
//! the attempt count.
//!
//! # Usage
//!
//! ```bash
//! OPENAI_API_KEY=sk-... cargo run --example basic_generation
//! ```

use std::sync::Arc;

use polar_tester::prompt::assemble;
use polar_tester::{ChatClient, ChatClientConfig, CliValidator, Generator};

const CONTEXT: &str = "Polar policies declare resources with `resource Name { ... }` blocks \
listing permissions, roles, and relations, then derive permissions from roles.";

#[tokio::main]
async fn main() -> Result<(), String> {
    // 1. Create the model client.
    let api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| "Set OPENAI_API_KEY env var to your API key")?;
    let client = ChatClient::new(ChatClientConfig::new(api_key)).map_err(|e| e.to_string())?;

    // 2. Wire the generation loop to the default validator.
    let generator = Generator::new(Arc::new(client), Arc::new(CliValidator::default()));

    // 3. Assemble the request and run.
    let request = assemble(
        vec![CONTEXT.to_string()],
        "Organization members can read every document in their organization.",
        None,
        None,
    )
    .map_err(|e| e.to_string())?;
    let result = generator
        .generate(request)
        .await
        .map_err(|e| e.to_string())?;

    println!("{}", result.text);
    println!(
        "\n--- passed: {} | attempts: {} | tokens: {:?}",
        result.passed(),
        result.attempts,
        result.tokens_used
    );
    Ok(())
}
