use grok_proxy::keystore::{ApiKeyStore, SqliteKeyStore};

const USAGE: &str =
    "usage: grok-proxy-keys <keys.db> <add [--expires-days N] | check <key> | list>";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let db_path = args.next().ok_or(USAGE)?;
    let command = args.next().ok_or(USAGE)?;

    let store = SqliteKeyStore::new(&db_path);
    store.init().await?;

    match command.as_str() {
        "add" => {
            let mut expiration_days: Option<u32> = None;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--expires-days" => {
                        let raw = args.next().ok_or("missing value for --expires-days")?;
                        expiration_days =
                            Some(raw.parse::<u32>().map_err(|_| "invalid --expires-days")?);
                    }
                    other => return Err(format!("unknown argument {other}: {USAGE}").into()),
                }
            }
            let key = store.add_key(expiration_days).await?;
            println!("{key}");
        }
        "check" => {
            let key = args.next().ok_or(USAGE)?;
            if store.is_valid(&key).await? {
                println!("valid");
            } else {
                println!("invalid");
                std::process::exit(1);
            }
        }
        "list" => {
            for record in store.list_keys().await? {
                let expiry = record.expiring_date.as_deref().unwrap_or("never");
                println!("{}\t{}\texpires: {}", record.id, record.api_key, expiry);
            }
        }
        other => return Err(format!("unknown command {other}: {USAGE}").into()),
    }

    Ok(())
}
