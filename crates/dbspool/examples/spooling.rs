//! Spooling example.
//!
//! Runs more transactions than the pool has connections. The extra
//! transactions are spooled: their statements are recorded and replayed in
//! order once a connection frees up.
//!
//! # Running
//!
//! ```bash
//! RUST_LOG=dbspool=debug cargo run --example spooling
//! ```

use dbspool::{Pool, PoolError, Statement, Value};
use dbspool_testing::{FakeFactory, init_tracing};

#[tokio::main]
async fn main() -> Result<(), PoolError> {
    init_tracing();

    let factory = FakeFactory::new();
    let pool = Pool::builder(factory.clone()).max_connections(2).build()?;

    let mut transactions = Vec::new();
    for n in 0..5_i64 {
        let txn = pool.acquire();
        println!(
            "transaction {} acquired, connected: {}",
            txn.id(),
            txn.is_connected()
        );
        let insert = txn.exec(
            Statement::new("INSERT INTO calendar (name) VALUES (%s)")
                .bind(Value::Text(format!("calendar-{n}"))),
        );
        let commit = txn.commit();
        transactions.push((txn, insert, commit));
    }

    let status = pool.status();
    println!(
        "busy: {}, waiting: {}, connecting: {}",
        status.busy, status.waiting, status.connecting
    );

    for (txn, insert, commit) in transactions {
        let rows = insert.await?;
        commit.await?;
        println!("transaction {} ran on connection {:?}", txn.id(), rows[0][0]);
    }

    pool.stop_service().await?;
    println!(
        "opened {} connections, {} commits",
        factory.connections(),
        factory.commits()
    );
    Ok(())
}
