// Boots one room server per test binary on an ephemeral port.
use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

static BASE_URL: OnceLock<String> = OnceLock::new();

/// Starts the server on first use and returns its base URL.
pub fn ensure_server() -> &'static str {
    BASE_URL.get_or_init(|| {
        let slot = Arc::new(OnceLock::<String>::new());
        let server_slot = Arc::clone(&slot);

        // The server gets its own thread and runtime so it outlives each
        // `#[tokio::test]` runtime.
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Runtime::new().expect("server runtime");
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                    .await
                    .expect("bind ephemeral port");
                let addr = listener.local_addr().expect("local addr");
                let _ = server_slot.set(format!("http://{addr}"));
                room_server::run(listener).await.expect("server failed");
            });
        });

        wait_until_accepting(&slot)
    })
}

fn wait_until_accepting(slot: &OnceLock<String>) -> String {
    let base_url = loop {
        if let Some(url) = slot.get() {
            break url.clone();
        }
        std::thread::sleep(Duration::from_millis(10));
    };

    let addr = base_url
        .strip_prefix("http://")
        .expect("base url should use http://");
    for _ in 0..100 {
        if std::net::TcpStream::connect(addr).is_ok() {
            return base_url;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("server did not become ready in time");
}
