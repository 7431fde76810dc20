use chessnet::{PositionDataset, StopSignal, Trainer, TrainingConfig, init_logging};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    // 1. Load the configuration
    let path = std::env::args()
        .nth(1)
        .ok_or("usage: train <config.json>")?;
    let config = TrainingConfig::from_file(&path)?;

    // 2. Load the games
    let dataset = PositionDataset::load(&config.game_sources, config.dataset.clone())?;
    println!("{} games loaded", dataset.games().len());

    // 3. Train until done
    let mut trainer = Trainer::new(config)?;
    let report = trainer.run(&dataset, &StopSignal::new())?;

    println!("------------------------------------------------");
    println!("Outcome:          {:?}", report.outcome);
    println!("Steps:            {}", report.steps);
    println!("Epochs completed: {}", report.epochs_completed);
    if let Some(loss) = report.last_loss {
        println!(
            "Last loss:        {:.4} (policy {:.4}, value {:.4})",
            loss.total, loss.policy, loss.value
        );
    }
    println!("Skipped batches:  {}", report.skipped_batches + report.non_finite_batches);
    println!("Corrupt games:    {}", report.corrupt_games);
    for path in &report.checkpoints {
        println!("Checkpoint:       {}", path.display());
    }
    Ok(())
}
