use std::process;

#[tokio::main]
async fn main() {
    let config = match btcidx_node::parse_args() {
        Ok(Some(config)) => config,
        Ok(None) => return,
        Err(err) => {
            eprintln!("{err}");
            eprintln!();
            eprintln!("{}", btcidx_node::usage());
            process::exit(2);
        }
    };
    if let Err(err) = btcidx_node::run(config).await {
        eprintln!("btcidx: {err}");
        process::exit(1);
    }
}
