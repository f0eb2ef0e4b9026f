use futures_util::StreamExt;
use torii::{Config, Connection};

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let token = std::env::var("BOT_TOKEN")
        .map_err(|_| {
            println!("No BOT_TOKEN env var or invalid");
            std::process::exit(1);
        })
        .unwrap();

    let (connection, mut events) = Connection::single(Config::bot(&token)).unwrap();

    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            println!("{:?}", event);
        }
    });

    connection.run().await.unwrap();
}
