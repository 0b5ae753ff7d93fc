use solar_gateway::prelude::*;

#[tokio::main]
async fn main() {
    let options = Options::new();

    if let Err(err) = solar_gateway::app(options).await {
        error!("{:#}", err);
        eprintln!("solar-gateway: {:#}", err);
        std::process::exit(255);
    }
}
