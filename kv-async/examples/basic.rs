use std::sync::Arc;

use kv_async::{callback, engine::mem::MemEngine, AsyncConfig, OpError, Subsystem};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .init();
    tracing::info!("starting");

    let engine = MemEngine::new();
    engine.create_table("table:fruit", "S", "S").unwrap();
    engine.create_table("table:log", "r", "S").unwrap();

    let system = Subsystem::start(Arc::new(engine.clone()), AsyncConfig::default()).unwrap();
    let (cb, mut completions) = callback::channel();

    for (name, color) in [("apple", "red"), ("banana", "yellow"), ("cherry", "red")] {
        let mut op = system.allocate("table:fruit", "", Arc::clone(&cb)).unwrap();
        op.set_key(name);
        op.set_value(color);
        op.put().unwrap();
    }
    for recno in 1..=3u64 {
        let mut op = system.allocate("table:log", "", Arc::clone(&cb)).unwrap();
        op.set_key_recno(recno);
        op.set_value(format!("entry {recno}"));
        op.insert().unwrap();
    }
    for _ in 0..6 {
        let done = completions.recv().await.unwrap();
        assert!(done.result.is_ok(), "{:?}", done.result);
    }

    let mut op = system.allocate("table:fruit", "", Arc::clone(&cb)).unwrap();
    op.set_key("banana");
    op.search().unwrap();
    let found = completions.recv().await.unwrap();
    assert_eq!(found.value.as_deref(), Some(&b"yellow"[..]));

    // insert without overwrite reports the existing key
    let mut op = system
        .allocate("table:fruit", "overwrite=false", Arc::clone(&cb))
        .unwrap();
    op.set_key("apple");
    op.set_value("green");
    op.insert().unwrap();
    let dup = completions.recv().await.unwrap();
    assert!(matches!(dup.result, Err(OpError::Engine(_))));

    system.flush().unwrap();
    assert_eq!(engine.len("table:fruit"), 3);
    assert_eq!(engine.len("table:log"), 3);

    system.shutdown();
    tracing::info!(metrics = ?kv_async::metrics::global(), "done");
}
