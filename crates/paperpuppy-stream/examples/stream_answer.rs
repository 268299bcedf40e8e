use std::sync::Arc;

use paperpuppy_stream::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), StreamError> {
    init_observability();

    let client = ClientConfig::from_env()?;
    let store = Arc::new(InMemoryMessageStore::new());
    let controller = StreamController::builder()
        .transport(Arc::new(HttpTransport::new(&client)?))
        .credentials(Arc::new(EnvToken::new(client.token_env.clone())))
        .store(store.clone())
        .default_session(1_u64)
        .build()?;

    let mut content = controller.subscribe_content();
    let printer = tokio::spawn(async move {
        let mut shown = String::new();
        while content.changed().await.is_ok() {
            let text = content.borrow_and_update().clone();
            if !text.starts_with(shown.as_str()) {
                shown.clear();
            }
            print!("{}", &text[shown.len()..]);
            shown = text;
        }
    });

    let endpoint = client.send_url(&SessionId::from(1_u64));
    let payload =
        ChatRequest::new("Summarize the attention paper in two sentences.").into_payload();
    let answer = controller.start(endpoint, payload, StartOptions::new()).await?;
    println!();

    drop(controller);
    printer.abort();
    let stored = store.messages(&SessionId::from(1_u64)).len();
    eprintln!("{} characters, {stored} stored messages", answer.len());
    Ok(())
}
