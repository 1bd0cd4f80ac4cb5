#[tokio::main]
async fn main() {
    if let Err(err) = cirrus::server::run().await {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}
