use std::path::Path;

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{
    mpsc::{Receiver, Sender},
    oneshot,
};

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub password: String,
    pub email: Option<String>,
}

pub enum SqlCommand {
    AddUser {
        username: String,
        password: String,
        email: Option<String>,
        reply: oneshot::Sender<Result<bool>>,
    },
    GetUser {
        username: String,
        reply: oneshot::Sender<Result<Option<UserRecord>>>,
    },
    UpdateUser {
        username: String,
        password: Option<String>,
        email: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
}

pub async fn loop_db(mut conn: Connection, mut rx: Receiver<SqlCommand>) -> Result<()> {
    loop {
        let Some(cmd) = rx.recv().await else {
            return Ok(());
        };
        match cmd {
            SqlCommand::AddUser {
                username,
                password,
                email,
                reply,
            } => {
                if reply.send(do_add_user(&mut conn, &username, &password, email.as_deref())).is_err() {
                    tracing::warn!("failed to send reply to add-user command");
                }
            }
            SqlCommand::GetUser { username, reply } => {
                if reply.send(do_get_user(&mut conn, &username)).is_err() {
                    tracing::warn!("failed to send reply to get-user command");
                }
            }
            SqlCommand::UpdateUser {
                username,
                password,
                email,
                reply,
            } => {
                if reply
                    .send(do_update_user(&mut conn, &username, password.as_deref(), email.as_deref()))
                    .is_err()
                {
                    tracing::warn!("failed to send reply to update-user command");
                }
            }
        }
    }
}

pub fn init(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(include_str!("./init.sql"))?;

    Ok(conn)
}

/// Returns false when the username is already taken.
fn do_add_user(
    conn: &mut Connection,
    username: &str,
    password: &str,
    email: Option<&str>,
) -> Result<bool> {
    let mut stmt = conn
        .prepare_cached("INSERT OR IGNORE INTO user (username, password, email) VALUES (?, ?, ?)")?;
    let inserted = stmt.execute(params![username, password, email])?;
    Ok(inserted == 1)
}

fn do_get_user(conn: &mut Connection, username: &str) -> Result<Option<UserRecord>> {
    let mut stmt =
        conn.prepare_cached("SELECT id, username, password, email FROM user WHERE username = ?")?;
    let user = stmt
        .query_row(params![username], |r| {
            Ok(UserRecord {
                id: r.get(0)?,
                username: r.get(1)?,
                password: r.get(2)?,
                email: r.get(3)?,
            })
        })
        .optional()?;
    Ok(user)
}

/// Blank fields keep their stored value.
fn do_update_user(
    conn: &mut Connection,
    username: &str,
    password: Option<&str>,
    email: Option<&str>,
) -> Result<()> {
    if let Some(password) = password.filter(|p| !p.is_empty()) {
        let mut stmt = conn.prepare_cached("UPDATE user SET password = ? WHERE username = ?")?;
        stmt.execute(params![password, username])?;
    }
    if let Some(email) = email.filter(|e| !e.is_empty()) {
        let mut stmt = conn.prepare_cached("UPDATE user SET email = ? WHERE username = ?")?;
        stmt.execute(params![email, username])?;
    }
    Ok(())
}

pub async fn add_user(
    tx: &Sender<SqlCommand>,
    username: String,
    password: String,
    email: Option<String>,
) -> Result<bool> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(SqlCommand::AddUser {
        username,
        password,
        email,
        reply: reply_tx,
    })
    .await?;
    let added = reply_rx.await??;
    Ok(added)
}

pub async fn get_user(tx: &Sender<SqlCommand>, username: String) -> Result<Option<UserRecord>> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(SqlCommand::GetUser {
        username,
        reply: reply_tx,
    })
    .await?;
    let user = reply_rx.await??;
    Ok(user)
}

pub async fn update_user(
    tx: &Sender<SqlCommand>,
    username: String,
    password: Option<String>,
    email: Option<String>,
) -> Result<()> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(SqlCommand::UpdateUser {
        username,
        password,
        email,
        reply: reply_tx,
    })
    .await?;
    reply_rx.await??;
    Ok(())
}
