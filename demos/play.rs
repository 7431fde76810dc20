use std::io;

use chessnet::{
    InferenceConfig, InferenceEngine, InteractiveSession, init_logging, position_from_fen,
    select_device, shakmaty::Chess,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let path = std::env::args()
        .nth(1)
        .ok_or("usage: play <config.json>")?;
    let config = InferenceConfig::from_file(&path)?;

    let device = select_device(config.device)?;
    let engine = InferenceEngine::from_checkpoint(&config.checkpoint_path, device)?;

    if config.interactive {
        let start = match &config.fen {
            Some(fen) => position_from_fen(fen)?,
            None => Chess::default(),
        };
        let mut session = InteractiveSession::new(&engine, config.top_k)
            .with_engine_color(config.engine_color.map(Into::into))
            .with_position(start);
        let summary = session.run(io::stdin().lock(), &mut io::stdout())?;
        println!("Final position: {}", summary.final_fen);
        return Ok(());
    }

    let fen = config
        .fen
        .as_deref()
        .unwrap_or("rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1");
    let result = engine.analyse_fen(fen, config.top_k)?;

    println!("------------------------------------------------");
    println!("Evaluation:                     {:+.3}", result.value);
    println!("Win Probability (Side to move): {:.2}%", result.win_probability * 100.0);
    println!("------------------------------------------------");
    println!("Top {} Predicted Moves:", config.top_k);
    for (i, m) in result.policy.iter().enumerate() {
        println!("{}. {:<6} ({:.2}%)", i + 1, m.uci.to_string(), m.probability * 100.0);
    }
    Ok(())
}
