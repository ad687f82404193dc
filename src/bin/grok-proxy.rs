use grok_proxy::{GrokClient, ProxyConfig, ProxyState, SqliteKeyStore, StaticKeyStore, router};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);

    let mut config_path: Option<String> = None;
    let mut listen: Option<String> = None;
    let mut upstream: Option<String> = None;
    let mut upstream_proxy: Option<String> = None;
    let mut keys_db: Option<String> = None;
    let mut api_keys: Vec<String> = Vec::new();
    let mut json_logs = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config_path = Some(args.next().ok_or("missing value for --config")?);
            }
            "--listen" | "--addr" => {
                listen = Some(args.next().ok_or("missing value for --listen/--addr")?);
            }
            "--upstream" => {
                upstream = Some(args.next().ok_or("missing value for --upstream")?);
            }
            "--proxy" => {
                upstream_proxy = Some(args.next().ok_or("missing value for --proxy")?);
            }
            "--sqlite" => {
                keys_db = Some(args.next().ok_or("missing value for --sqlite")?);
            }
            "--api-key" => {
                api_keys.push(args.next().ok_or("missing value for --api-key")?);
            }
            "--json-logs" => {
                json_logs = true;
            }
            other => {
                return Err(format!(
                    "unknown argument {other}: usage: grok-proxy [--config PATH] [--listen HOST:PORT] [--upstream URL] [--proxy ORIGIN] [--sqlite PATH] [--api-key KEY] [--json-logs]"
                )
                .into());
            }
        }
    }

    let mut config = match config_path {
        Some(path) => ProxyConfig::load(&path)?,
        None => ProxyConfig::default(),
    };
    config.apply_env();
    if let Some(listen) = listen {
        config.listen = listen;
    }
    if let Some(upstream) = upstream {
        config.upstream_url = upstream;
    }
    if let Some(proxy) = upstream_proxy {
        config.upstream_proxy = Some(proxy);
    }
    if let Some(keys_db) = keys_db {
        config.keys_db = Some(keys_db.into());
    }
    config.api_keys.extend(api_keys);
    if json_logs {
        config.json_logs = true;
    }
    config.validate()?;

    let provider = match config.upstream_proxy.as_deref() {
        Some(origin) => GrokClient::with_proxy(&config.upstream_url, origin)?,
        None => GrokClient::new(&config.upstream_url)?,
    };

    let mut state = match config.keys_db.as_ref() {
        Some(path) => {
            let store = SqliteKeyStore::new(path);
            store.init().await?;
            ProxyState::new(provider, store)
        }
        None => ProxyState::new(provider, StaticKeyStore::new(config.api_keys.clone())),
    };
    if config.json_logs {
        state = state.with_json_logs();
    }

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    eprintln!(
        "grok-proxy listening on {} (upstream {})",
        config.listen, config.upstream_url
    );
    axum::serve(listener, router(state)).await?;
    Ok(())
}
