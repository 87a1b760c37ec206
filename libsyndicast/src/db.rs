//! Database operations for Syndicast

use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::path::Path;

use crate::error::{DbError, Result};
use crate::types::{
    AppCredentials, PlatformConfig, Post, PostMedia, PostResult, PostStatus, Project,
    RefreshedCredentials, SocialAccount,
};

/// A post loaded together with everything the orchestrator needs: the owning
/// project, targeted account connections, media rows, and per-platform or
/// per-account configuration overrides.
#[derive(Debug, Clone)]
pub struct PostBundle {
    pub post: Post,
    pub project: Project,
    pub accounts: Vec<SocialAccount>,
    pub media: Vec<PostMedia>,
    pub configs: Vec<PlatformConfig>,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Use forward slashes for SQLite URL (works on both Windows and Unix)
        // Use mode=rwc to allow creating the database file if it doesn't exist
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    // ------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------

    pub async fn create_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, name, api_key, billing_customer_id)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&project.id)
        .bind(&project.name)
        .bind(&project.api_key)
        .bind(&project.billing_customer_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, api_key, billing_customer_id
            FROM projects WHERE id = ?
            "#,
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| Project {
            id: r.get("id"),
            name: r.get("name"),
            api_key: r.get("api_key"),
            billing_customer_id: r.get("billing_customer_id"),
        }))
    }

    // ------------------------------------------------------------------
    // Posts
    // ------------------------------------------------------------------

    pub async fn create_post(&self, post: &Post) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO posts (id, project_id, caption, created_at, scheduled_at, status)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.project_id)
        .bind(&post.caption)
        .bind(post.created_at)
        .bind(post.scheduled_at)
        .bind(post.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        let row = sqlx::query(
            r#"
            SELECT id, project_id, caption, created_at, scheduled_at, status
            FROM posts WHERE id = ?
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| post_from_row(&r)))
    }

    pub async fn update_post_status(&self, post_id: &str, status: PostStatus) -> Result<()> {
        sqlx::query("UPDATE posts SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(post_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Scheduled posts that are due at `now` and have not started processing.
    pub async fn list_due_posts(&self, now: i64) -> Result<Vec<Post>> {
        let rows = sqlx::query(
            r#"
            SELECT id, project_id, caption, created_at, scheduled_at, status
            FROM posts
            WHERE status = 'scheduled' AND scheduled_at IS NOT NULL AND scheduled_at <= ?
            ORDER BY scheduled_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(post_from_row).collect())
    }

    /// Load a post with its joined project, accounts, media, and configs.
    ///
    /// # Errors
    ///
    /// Returns `DbError::NotFound` if the post or its owning project does
    /// not exist.
    pub async fn load_post_bundle(&self, post_id: &str) -> Result<PostBundle> {
        let post = self
            .get_post(post_id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("post {}", post_id)))?;

        let project = self
            .get_project(&post.project_id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("project {}", post.project_id)))?;

        let accounts = self.list_post_accounts(post_id).await?;
        let media = self.list_post_media(post_id).await?;
        let configs = self.list_platform_configs(post_id).await?;

        Ok(PostBundle {
            post,
            project,
            accounts,
            media,
            configs,
        })
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    pub async fn create_account(&self, account: &SocialAccount) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO social_accounts
                (id, project_id, platform, external_id, handle, access_token, refresh_token,
                 access_token_expires_at, refresh_token_expires_at, connection_kind)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&account.id)
        .bind(&account.project_id)
        .bind(&account.platform)
        .bind(&account.external_id)
        .bind(&account.handle)
        .bind(&account.access_token)
        .bind(&account.refresh_token)
        .bind(account.access_token_expires_at)
        .bind(account.refresh_token_expires_at)
        .bind(&account.connection_kind)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn link_post_account(&self, post_id: &str, account_id: &str) -> Result<()> {
        sqlx::query("INSERT INTO post_accounts (post_id, account_id) VALUES (?, ?)")
            .bind(post_id)
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn list_post_accounts(&self, post_id: &str) -> Result<Vec<SocialAccount>> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.project_id, a.platform, a.external_id, a.handle,
                   a.access_token, a.refresh_token,
                   a.access_token_expires_at, a.refresh_token_expires_at, a.connection_kind
            FROM social_accounts a
            JOIN post_accounts pa ON pa.account_id = a.id
            WHERE pa.post_id = ?
            ORDER BY a.id
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(account_from_row).collect())
    }

    pub async fn get_account(&self, account_id: &str) -> Result<Option<SocialAccount>> {
        let row = sqlx::query(
            r#"
            SELECT id, project_id, platform, external_id, handle,
                   access_token, refresh_token,
                   access_token_expires_at, refresh_token_expires_at, connection_kind
            FROM social_accounts WHERE id = ?
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| account_from_row(&r)))
    }

    /// Persist refreshed token material on an account connection.
    ///
    /// A refresh response without a new refresh token keeps the stored one.
    pub async fn update_account_tokens(
        &self,
        account_id: &str,
        refreshed: &RefreshedCredentials,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE social_accounts
            SET access_token = ?,
                refresh_token = COALESCE(?, refresh_token),
                access_token_expires_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&refreshed.access_token)
        .bind(&refreshed.refresh_token)
        .bind(refreshed.expires_at)
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Null the access token, marking the account disconnected.
    pub async fn disconnect_account(&self, account_id: &str) -> Result<()> {
        sqlx::query("UPDATE social_accounts SET access_token = NULL WHERE id = ?")
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------

    pub async fn create_media(&self, media: &PostMedia) -> Result<i64> {
        let tags = serde_json::to_string(&media.tags).unwrap_or_else(|_| "[]".to_string());

        let result = sqlx::query(
            r#"
            INSERT INTO post_media
                (post_id, url, media_type, thumbnail_url, thumbnail_timestamp_ms,
                 platform_scope, account_scope, skip_processing, tags)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&media.post_id)
        .bind(&media.url)
        .bind(media.media_type.map(|t| t.as_str()))
        .bind(&media.thumbnail_url)
        .bind(media.thumbnail_timestamp_ms)
        .bind(&media.platform_scope)
        .bind(&media.account_scope)
        .bind(media.skip_processing as i64)
        .bind(tags)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.last_insert_rowid())
    }

    pub async fn list_post_media(&self, post_id: &str) -> Result<Vec<PostMedia>> {
        let rows = sqlx::query(
            r#"
            SELECT id, post_id, url, media_type, thumbnail_url, thumbnail_timestamp_ms,
                   platform_scope, account_scope, skip_processing, tags
            FROM post_media WHERE post_id = ?
            ORDER BY position, id
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(media_from_row).collect())
    }

    /// Record a localizer outcome: the durable URL(s) and detected type.
    pub async fn update_media_localization(
        &self,
        media_id: i64,
        url: &str,
        thumbnail_url: Option<&str>,
        media_type: crate::types::MediaType,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE post_media
            SET url = ?, thumbnail_url = COALESCE(?, thumbnail_url), media_type = ?
            WHERE id = ?
            "#,
        )
        .bind(url)
        .bind(thumbnail_url)
        .bind(media_type.as_str())
        .bind(media_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Platform configs
    // ------------------------------------------------------------------

    pub async fn create_platform_config(&self, config: &PlatformConfig) -> Result<i64> {
        let settings = config
            .settings
            .as_ref()
            .map(|s| s.to_string());

        let result = sqlx::query(
            r#"
            INSERT INTO platform_configs (post_id, platform, account_id, caption, settings)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&config.post_id)
        .bind(&config.platform)
        .bind(&config.account_id)
        .bind(&config.caption)
        .bind(settings)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.last_insert_rowid())
    }

    pub async fn list_platform_configs(&self, post_id: &str) -> Result<Vec<PlatformConfig>> {
        let rows = sqlx::query(
            r#"
            SELECT id, post_id, platform, account_id, caption, settings
            FROM platform_configs WHERE post_id = ?
            ORDER BY id
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|r| PlatformConfig {
                id: Some(r.get("id")),
                post_id: r.get("post_id"),
                platform: r.get("platform"),
                account_id: r.get("account_id"),
                caption: r.get("caption"),
                settings: r
                    .get::<Option<String>, _>("settings")
                    .and_then(|s| serde_json::from_str(&s).ok()),
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------

    pub async fn create_post_result(&self, result: &PostResult) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO post_results
                (post_id, account_id, platform, success, provider_post_id, provider_post_url,
                 error_message, error_details, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&result.post_id)
        .bind(&result.account_id)
        .bind(&result.platform)
        .bind(result.success as i64)
        .bind(&result.provider_post_id)
        .bind(&result.provider_post_url)
        .bind(&result.error_message)
        .bind(&result.error_details)
        .bind(result.completed_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.last_insert_rowid())
    }

    pub async fn list_post_results(&self, post_id: &str) -> Result<Vec<PostResult>> {
        let rows = sqlx::query(
            r#"
            SELECT id, post_id, account_id, platform, success, provider_post_id,
                   provider_post_url, error_message, error_details, completed_at
            FROM post_results WHERE post_id = ?
            ORDER BY id
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|r| PostResult {
                id: Some(r.get("id")),
                post_id: r.get("post_id"),
                account_id: r.get("account_id"),
                platform: r.get("platform"),
                success: r.get::<i64, _>("success") != 0,
                provider_post_id: r.get("provider_post_id"),
                provider_post_url: r.get("provider_post_url"),
                error_message: r.get("error_message"),
                error_details: r.get("error_details"),
                completed_at: r.get("completed_at"),
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // App credentials
    // ------------------------------------------------------------------

    pub async fn create_app_credentials(&self, creds: &AppCredentials) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO app_credentials (project_id, platform, sub_type, client_id, client_secret)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&creds.project_id)
        .bind(&creds.platform)
        .bind(&creds.sub_type)
        .bind(&creds.client_id)
        .bind(&creds.client_secret)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// All credential rows for one (project, platform) pair; selection among
    /// sub-types happens in `resolve`.
    pub async fn list_app_credentials(
        &self,
        project_id: &str,
        platform: &str,
    ) -> Result<Vec<AppCredentials>> {
        let rows = sqlx::query(
            r#"
            SELECT project_id, platform, sub_type, client_id, client_secret
            FROM app_credentials WHERE project_id = ? AND platform = ?
            ORDER BY id
            "#,
        )
        .bind(project_id)
        .bind(platform)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|r| AppCredentials {
                project_id: r.get("project_id"),
                platform: r.get("platform"),
                sub_type: r.get("sub_type"),
                client_id: r.get("client_id"),
                client_secret: r.get("client_secret"),
            })
            .collect())
    }
}

fn post_from_row(r: &sqlx::sqlite::SqliteRow) -> Post {
    Post {
        id: r.get("id"),
        project_id: r.get("project_id"),
        caption: r.get("caption"),
        created_at: r.get("created_at"),
        scheduled_at: r.get("scheduled_at"),
        status: PostStatus::from_str_or_draft(&r.get::<String, _>("status")),
    }
}

fn account_from_row(r: &sqlx::sqlite::SqliteRow) -> SocialAccount {
    SocialAccount {
        id: r.get("id"),
        project_id: r.get("project_id"),
        platform: r.get("platform"),
        external_id: r.get("external_id"),
        handle: r.get("handle"),
        access_token: r.get("access_token"),
        refresh_token: r.get("refresh_token"),
        access_token_expires_at: r.get("access_token_expires_at"),
        refresh_token_expires_at: r.get("refresh_token_expires_at"),
        connection_kind: r.get("connection_kind"),
    }
}

fn media_from_row(r: &sqlx::sqlite::SqliteRow) -> PostMedia {
    PostMedia {
        id: Some(r.get("id")),
        post_id: r.get("post_id"),
        url: r.get("url"),
        media_type: r
            .get::<Option<String>, _>("media_type")
            .and_then(|t| match t.as_str() {
                "image" => Some(crate::types::MediaType::Image),
                "video" => Some(crate::types::MediaType::Video),
                _ => None,
            }),
        thumbnail_url: r.get("thumbnail_url"),
        thumbnail_timestamp_ms: r.get("thumbnail_timestamp_ms"),
        platform_scope: r.get("platform_scope"),
        account_scope: r.get("account_scope"),
        skip_processing: r.get::<i64, _>("skip_processing") != 0,
        tags: serde_json::from_str(&r.get::<String, _>("tags")).unwrap_or_default(),
    }
}
