use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use crate::models::credential::Credential;
use crate::models::job::JobId;
use crate::models::model_config::Quality;
use crate::models::result::{NewResultRecord, ResultRecord};

/// Least recently used active credential, never-used keys first.
pub async fn least_recently_used_credential(
    pool: &PgPool,
) -> Result<Option<Credential>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, api_key, last_used_at, is_active
        FROM api_credentials
        WHERE is_active = TRUE
        ORDER BY last_used_at ASC NULLS FIRST
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    row.map(|r| {
        Ok(Credential {
            id: r.try_get("id")?,
            api_key: r.try_get("api_key")?,
            last_used_at: r.try_get("last_used_at")?,
            is_active: r.try_get("is_active")?,
        })
    })
    .transpose()
}

/// Record that a credential was handed out.
pub async fn touch_credential(
    pool: &PgPool,
    credential_id: Uuid,
    used_at: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE api_credentials SET last_used_at = $1 WHERE id = $2")
        .bind(used_at)
        .bind(credential_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Atomically deduct credits. Returns the new balance, or `None` when the
/// balance is too low (nothing is deducted in that case).
pub async fn deduct_credits(
    pool: &PgPool,
    user_id: &str,
    amount: i32,
) -> Result<Option<i32>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        UPDATE user_credits
        SET credits = credits - $2, updated_at = NOW()
        WHERE user_id = $1 AND credits >= $2
        RETURNING credits
        "#,
    )
    .bind(user_id)
    .bind(amount)
    .fetch_optional(pool)
    .await?;

    row.map(|r| r.try_get("credits")).transpose()
}

pub async fn add_credits(pool: &PgPool, user_id: &str, amount: i32) -> Result<i32, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO user_credits (user_id, credits)
        VALUES ($1, $2)
        ON CONFLICT (user_id)
        DO UPDATE SET credits = user_credits.credits + EXCLUDED.credits, updated_at = NOW()
        RETURNING credits
        "#,
    )
    .bind(user_id)
    .bind(amount)
    .fetch_one(pool)
    .await?;

    row.try_get("credits")
}

pub async fn get_credits(pool: &PgPool, user_id: &str) -> Result<i32, sqlx::Error> {
    let row = sqlx::query("SELECT credits FROM user_credits WHERE user_id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

    Ok(match row {
        Some(r) => r.try_get("credits")?,
        None => 0,
    })
}

/// Insert a generated image row
pub async fn insert_result(
    pool: &PgPool,
    record: &NewResultRecord,
) -> Result<ResultRecord, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO user_images
            (job_id, user_id, storage_path, prompt, seed, width, height, model,
             quality, aspect_ratio, is_private)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING id, job_id, user_id, storage_path, prompt, seed, width, height, model,
                  quality, aspect_ratio, is_private, created_at
        "#,
    )
    .bind(record.job_id.0)
    .bind(&record.user_id)
    .bind(&record.storage_path)
    .bind(&record.prompt)
    .bind(i64::try_from(record.seed).map_err(|e| sqlx::Error::Encode(Box::new(e)))?)
    .bind(record.width as i32)
    .bind(record.height as i32)
    .bind(&record.model)
    .bind(record.quality.to_string())
    .bind(&record.aspect_ratio)
    .bind(record.is_private)
    .fetch_one(pool)
    .await?;

    result_from_row(&row)
}

/// Look up the result row written for a job, if any.
pub async fn find_result_by_job(
    pool: &PgPool,
    job_id: JobId,
) -> Result<Option<ResultRecord>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, job_id, user_id, storage_path, prompt, seed, width, height, model,
               quality, aspect_ratio, is_private, created_at
        FROM user_images
        WHERE job_id = $1
        "#,
    )
    .bind(job_id.0)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(result_from_row).transpose()
}

fn result_from_row(r: &PgRow) -> Result<ResultRecord, sqlx::Error> {
    let quality: String = r.try_get("quality")?;
    let quality: Quality = quality
        .parse()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    let seed: i64 = r.try_get("seed")?;
    let width: i32 = r.try_get("width")?;
    let height: i32 = r.try_get("height")?;

    Ok(ResultRecord {
        id: r.try_get("id")?,
        record: NewResultRecord {
            job_id: JobId(r.try_get("job_id")?),
            user_id: r.try_get("user_id")?,
            storage_path: r.try_get("storage_path")?,
            prompt: r.try_get("prompt")?,
            seed: u64::try_from(seed).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            width: width as u32,
            height: height as u32,
            model: r.try_get("model")?,
            quality,
            aspect_ratio: r.try_get("aspect_ratio")?,
            is_private: r.try_get("is_private")?,
        },
        created_at: r.try_get("created_at")?,
    })
}
