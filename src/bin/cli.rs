use clap::{Parser, Subcommand};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;

const SESSION_FILE: &str = ".reservio_session";

#[derive(Parser)]
#[command(name = "reservio-cli")]
#[command(about = "CLI for the reservio API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,
}

#[derive(Subcommand)]
enum Commands {
    Register {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
    },
    Login {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
    },
    Profile,
    RequestReset {
        #[arg(short, long)]
        email: String,
    },
    ResetPassword {
        #[arg(short, long)]
        token: String,
        #[arg(short, long)]
        password: String,
    },
    Children,
    AddChild {
        #[arg(short, long)]
        name: String,
        #[arg(short, long)]
        age: Option<i64>,
        #[arg(short, long)]
        birthdate: Option<String>,
    },
    DeleteChild {
        #[arg(short, long)]
        id: u64,
    },
    Slots,
    Calendar,
    Reserve {
        #[arg(short, long)]
        child_id: u64,
        #[arg(short, long)]
        slot_id: u64,
    },
    Reservations {
        #[arg(short = 'S', long)]
        status: Option<String>,
    },
    Cancel {
        #[arg(short, long)]
        id: u64,
    },
    CreateSlot {
        #[arg(short, long)]
        date: String,
        #[arg(short, long)]
        capacity: u32,
    },
    Approve {
        #[arg(short, long)]
        id: u64,
    },
    Reject {
        #[arg(short, long)]
        id: u64,
    },
    AllReservations {
        #[arg(short = 'S', long)]
        status: Option<String>,
        #[arg(short = 's', long)]
        slot_id: Option<u64>,
    },
    Users,
    SetRole {
        #[arg(short, long)]
        id: u64,
        #[arg(short, long)]
        role: String,
    },
    Announce {
        #[arg(short, long)]
        title: String,
        #[arg(short, long)]
        content: String,
    },
    Dashboard,
    Logout,
}

/// Cookie and CSRF token kept between invocations.
#[derive(Serialize, Deserialize, Default)]
struct SavedSession {
    cookie: String,
    csrf_token: String,
}

impl SavedSession {
    fn load() -> Self {
        fs::read_to_string(SESSION_FILE)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn save(&self) -> std::io::Result<()> {
        fs::write(SESSION_FILE, serde_json::to_string(self)?)
    }

    fn attach(&self, request: RequestBuilder) -> RequestBuilder {
        if self.cookie.is_empty() {
            return request;
        }
        request
            .header("Cookie", &self.cookie)
            .header("X-CSRF-Token", &self.csrf_token)
    }

    /// Pick up a new cookie or CSRF token from the response.
    fn absorb(&mut self, response: &Response) -> bool {
        let mut changed = false;
        if let Some(cookie) = response
            .headers()
            .get("set-cookie")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
        {
            self.cookie = if cookie.ends_with('=') { String::new() } else { cookie.to_string() };
            changed = true;
        }
        if let Some(token) = response.headers().get("x-csrf-token").and_then(|v| v.to_str().ok()) {
            if token != self.csrf_token {
                self.csrf_token = token.to_string();
                changed = true;
            }
        }
        changed
    }
}

async fn send(session: &mut SavedSession, request: RequestBuilder) -> Result<(), Box<dyn std::error::Error>> {
    let res = session.attach(request).send().await?;
    if session.absorb(&res) {
        session.save()?;
    }
    let status = res.status();
    let body = res.text().await?;
    let pretty = serde_json::from_str::<Value>(&body)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or(body);
    println!("{status}\n{pretty}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();
    let mut session = SavedSession::load();
    let url = cli.url.trim_end_matches('/');

    let request = match cli.command {
        Commands::Register { email, password } => client
            .post(format!("{url}/api/auth/register"))
            .json(&json!({ "email": email, "password": password })),
        Commands::Login { email, password } => client
            .post(format!("{url}/api/auth/login"))
            .json(&json!({ "email": email, "password": password })),
        Commands::Profile => client.get(format!("{url}/api/user/profile")),
        Commands::RequestReset { email } => client
            .post(format!("{url}/api/auth/request-reset"))
            .json(&json!({ "email": email })),
        Commands::ResetPassword { token, password } => client
            .post(format!("{url}/api/auth/reset-password"))
            .json(&json!({ "token": token, "password": password })),
        Commands::Children => client.get(format!("{url}/api/parent/children")),
        Commands::AddChild { name, age, birthdate } => client
            .post(format!("{url}/api/parent/children"))
            .json(&json!({ "name": name, "age": age, "birthdate": birthdate })),
        Commands::DeleteChild { id } => client.delete(format!("{url}/api/parent/children/{id}")),
        Commands::Slots => client.get(format!("{url}/api/slots")),
        Commands::Calendar => client.get(format!("{url}/api/slots/calendar")),
        Commands::Reserve { child_id, slot_id } => client
            .post(format!("{url}/api/parent/reserve"))
            .json(&json!({ "child_id": child_id, "slot_id": slot_id })),
        Commands::Reservations { status } => {
            let mut query = Vec::new();
            if let Some(status) = status {
                query.push(("status", status));
            }
            client.get(format!("{url}/api/parent/reservations")).query(&query)
        }
        Commands::Cancel { id } => client.delete(format!("{url}/api/parent/reservations/{id}")),
        Commands::CreateSlot { date, capacity } => client
            .post(format!("{url}/api/admin/slots"))
            .json(&json!({ "date": date, "capacity": capacity })),
        Commands::Approve { id } => client.put(format!("{url}/api/admin/approve/{id}")),
        Commands::Reject { id } => client.put(format!("{url}/api/admin/reject/{id}")),
        Commands::AllReservations { status, slot_id } => {
            let mut query = Vec::new();
            if let Some(status) = status {
                query.push(("status", status));
            }
            if let Some(slot_id) = slot_id {
                query.push(("slot_id", slot_id.to_string()));
            }
            client.get(format!("{url}/api/admin/reservations")).query(&query)
        }
        Commands::Users => client.get(format!("{url}/api/admin/users")),
        Commands::SetRole { id, role } => client
            .put(format!("{url}/api/admin/users/{id}/role"))
            .json(&json!({ "role": role })),
        Commands::Announce { title, content } => client
            .post(format!("{url}/api/admin/announcements"))
            .json(&json!({ "title": title, "content": content })),
        Commands::Dashboard => client.get(format!("{url}/api/dashboard")),
        Commands::Logout => {
            let request = client.post(format!("{url}/api/auth/logout"));
            send(&mut session, request).await?;
            let _ = fs::remove_file(SESSION_FILE);
            println!("Session file removed.");
            return Ok(());
        }
    };

    send(&mut session, request).await
}
