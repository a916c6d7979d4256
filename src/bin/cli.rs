use std::fs;

use clap::{Parser, Subcommand};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};

const TOKEN_FILE: &str = ".tenantdb_token";

#[derive(Parser)]
#[command(name = "tenantdb-cli")]
#[command(about = "CLI for a tenantdb server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, default_value = "http://localhost:11111")]
    url: String,

    /// Token value; falls back to the saved token file
    #[arg(long, env = "TENANTDB_TOKEN")]
    token: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Save a token for later commands
    Login {
        token: String,
    },
    Logout,
    AddApp {
        #[arg(short, long)]
        name: String,
        /// 0 none, 1 user, 2 admin, 3 super
        #[arg(short, long, default_value_t = 2)]
        auth_level: u8,
        #[arg(short = 'p', long)]
        api_path: Option<String>,
    },
    ListApps,
    DeleteApp {
        #[arg(short, long)]
        id: String,
    },
    GetSchema,
    /// Replace the app schema with the JSON list in FILE
    UpdateSchema {
        #[arg(short, long)]
        file: String,
    },
    AddDataSharing {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        endpoint: String,
        #[arg(short = 'p', long)]
        api_path: String,
        /// Token issued by the peer for this agreement
        #[arg(short = 't', long)]
        remote_token: Option<String>,
    },
    Insert {
        #[arg(short = 'p', long)]
        api_path: String,
        #[arg(short = 'C', long)]
        collection: String,
        /// Document (or array of documents) as JSON
        #[arg(short, long)]
        data: String,
    },
    Get {
        #[arg(short = 'p', long)]
        api_path: String,
        #[arg(short = 'C', long)]
        collection: String,
        #[arg(short, long)]
        id: String,
    },
    Search {
        #[arg(short = 'p', long)]
        api_path: String,
        #[arg(short = 'C', long)]
        collection: String,
        #[arg(short, long, default_value = "{}")]
        query: String,
        #[arg(short, long, default_value_t = 0)]
        limit: usize,
    },
    /// Apply a path-update list, e.g. '[{"path":"status","value":"done"}]'
    Update {
        #[arg(short = 'p', long)]
        api_path: String,
        #[arg(short = 'C', long)]
        collection: String,
        #[arg(short, long)]
        id: String,
        #[arg(short, long)]
        updates: String,
    },
    Delete {
        #[arg(short = 'p', long)]
        api_path: String,
        #[arg(short = 'C', long)]
        collection: String,
        #[arg(short, long)]
        id: String,
    },
}

struct Api {
    client: Client,
    url: String,
    token: String,
}

impl Api {
    fn data(&self, api_path: &str, collection: &str) -> String {
        format!("{}/api/v1/data/{}/{}", self.url, api_path, collection)
    }

    async fn send(&self, request: RequestBuilder) -> Result<(), Box<dyn std::error::Error>> {
        let res = request.bearer_auth(&self.token).send().await?;
        let status = res.status();
        let text = res.text().await?;
        let body = serde_json::from_str::<Value>(&text)
            .and_then(|v| serde_json::to_string_pretty(&v))
            .unwrap_or(text);
        if status.is_success() {
            println!("{}", body);
        } else {
            eprintln!("{}: {}", status, body);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let token = cli
        .token
        .clone()
        .or_else(|| fs::read_to_string(TOKEN_FILE).ok())
        .map(|t| t.trim().to_string())
        .unwrap_or_default();
    let api = Api {
        client: Client::new(),
        url: cli.url.trim_end_matches('/').to_string(),
        token,
    };
    let client = &api.client;

    match cli.command {
        Commands::Login { token } => {
            fs::write(TOKEN_FILE, token)?;
            println!("Token saved to {}", TOKEN_FILE);
        }
        Commands::Logout => {
            let _ = fs::remove_file(TOKEN_FILE);
            println!("Token removed.");
        }
        Commands::AddApp { name, auth_level, api_path } => {
            let body = json!({ "name": name, "authLevel": auth_level, "apiPath": api_path });
            api.send(client.post(format!("{}/api/v1/apps", api.url)).json(&body)).await?;
        }
        Commands::ListApps => {
            api.send(client.get(format!("{}/api/v1/apps", api.url))).await?;
        }
        Commands::DeleteApp { id } => {
            api.send(client.delete(format!("{}/api/v1/apps/{}", api.url, id))).await?;
        }
        Commands::GetSchema => {
            api.send(client.get(format!("{}/api/v1/app/schema", api.url))).await?;
        }
        Commands::UpdateSchema { file } => {
            let schema: Value = serde_json::from_str(&fs::read_to_string(file)?)?;
            api.send(client.put(format!("{}/api/v1/app/schema", api.url)).json(&schema)).await?;
        }
        Commands::AddDataSharing { name, endpoint, api_path, remote_token } => {
            let body = json!({
                "name": name,
                "remoteApp": { "endpoint": endpoint, "apiPath": api_path, "token": remote_token },
            });
            api.send(client.post(format!("{}/api/v1/app/dataSharing", api.url)).json(&body)).await?;
        }
        Commands::Insert { api_path, collection, data } => {
            let body: Value = serde_json::from_str(&data)?;
            api.send(client.post(api.data(&api_path, &collection)).json(&body)).await?;
        }
        Commands::Get { api_path, collection, id } => {
            api.send(client.get(format!("{}/doc/{}", api.data(&api_path, &collection), id))).await?;
        }
        Commands::Search { api_path, collection, query, limit } => {
            let query: Value = serde_json::from_str(&query)?;
            let body = json!({ "query": query, "limit": limit });
            api.send(client.post(format!("{}/search", api.data(&api_path, &collection))).json(&body))
                .await?;
        }
        Commands::Update { api_path, collection, id, updates } => {
            let updates: Value = serde_json::from_str(&updates)?;
            api.send(
                client
                    .put(format!("{}/doc/{}", api.data(&api_path, &collection), id))
                    .json(&updates),
            )
            .await?;
        }
        Commands::Delete { api_path, collection, id } => {
            api.send(client.delete(format!("{}/doc/{}", api.data(&api_path, &collection), id))).await?;
        }
    }

    Ok(())
}
