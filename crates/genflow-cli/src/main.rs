//! Genflow CLI - model-independent entry point
//!
//! Model-dependent commands (`run`, `test`, `ddl`, `graph`) need a binary that
//! embeds a model via `genflow_cli::run_model`.

#[tokio::main]
async fn main() {
    genflow_cli::main_with(None).await
}
