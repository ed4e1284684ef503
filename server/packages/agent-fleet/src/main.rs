fn main() {
    if let Err(err) = agent_fleet::cli::run_agent_fleet() {
        tracing::error!(error = %err, "agent-fleet failed");
        std::process::exit(1);
    }
}
