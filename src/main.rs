use async_workerpool::{must, Options, Pool, Task};
use tokio::runtime::Builder;
use tokio::time::Duration;
use std::time::Instant;
use tracing_subscriber::EnvFilter;


fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let rt = Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    rt.block_on(async {
        let now = Instant::now();
        let pool: Pool<usize, bool> = must(Pool::new(
            Options::new()
                .workers(5)
                .handler(|task: Task<usize, bool>| async move {
                    task.respond(true);
                }),
        ));

        let completions: Vec<_> = (0..100)
            .map(|i| {
                let (task, done) = Task::new(i);
                pool.add(task).expect("pool is open");
                done
            })
            .collect();

        let mut ok = 0;
        for done in completions {
            if let Ok(true) = done.await_timeout(Duration::from_secs(5)).await {
                ok += 1;
            }
        }

        pool.shutdown().await;
        println!("completed {ok}/100 in {:?}", now.elapsed());
    });
}
