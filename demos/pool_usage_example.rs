// Example: basic worker-pool usage via the dotted-path facade.
//
// Run with: cargo run --example pool_usage_example (wired up via the
// `[[example]]` path override in Cargo.toml, since this crate's own
// `examples/` directory is reserved for retrieved reference material).

use workhive::dispatcher::{ActionContext, ActionFailure, ActionTree};
use workhive::{call, Pool, PoolOptions, Value};

fn actions() -> ActionTree {
    ActionTree::branch([(
        "math",
        ActionTree::branch([(
            "add",
            ActionTree::leaf(|_ctx: ActionContext, args: Vec<Value>| async move {
                let (Value::Int(a), Value::Int(b)) = (&args[0], &args[1]) else {
                    return Err(ActionFailure::new("expected two ints"));
                };
                Ok(Value::Int(a + b))
            }),
        )]),
    )])
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let pool = Pool::spawn(actions(), PoolOptions::default());
    let facade = pool.facade();

    let sum = call!(facade, math.add(2i64, 3i64)).await?;
    println!("math.add(2, 3) = {sum:?}");

    let stats = facade.stats().await;
    println!("workers={} idle={} completed={}", stats.workers, stats.idle, stats.completed);

    facade.shutdown().await;
    Ok(())
}
