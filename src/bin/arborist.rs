fn main() -> anyhow::Result<()> {
    pine::arborist_cli::run()
}
