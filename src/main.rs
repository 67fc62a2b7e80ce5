mod app;
mod errors;
mod graph;
mod prompting;
mod store;
mod sync;
#[cfg(test)]
mod test_support;
mod types;
mod webhook;

#[tokio::main]
async fn main() {
    app::run().await;
}
