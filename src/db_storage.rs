//! Postgres implementation of [`Store`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::errors::{AppError, ResultExt};
use crate::models::{
    CheckResource, DeclineReason, DocType, IdUpload, LookupKey, NewUser, ReportResource,
    SocialHandles, Upload, User, UserState, VerificationRequest, VerificationResponse,
    VerificationStage, WebhookEnvelope,
};
use crate::store::{StateUpdate, Store};

const USER_COLUMNS: &str = r#"
    id, created_at, email, eth_address, eth_amount, eth_cap, telegram,
    first_name, last_name, dob, phone, address, city, state_code, zip_code,
    country_code, ip, ip_country, dfp, confirmed_location,
    medium, reddit, twitter, linkedin, facebook,
    state, decline_reason, info, idm_tid, kyc_result, idm_result, doc_type,
    onfido_id, onfido_status, contribution_amount, contribution_tx
"#;

const REQUEST_COLUMNS: &str =
    "id, user_id, stage, created_at, requested_at, transaction_id, request_data, response_status";

const RESPONSE_COLUMNS: &str = r#"
    id, user_id, received_at, transaction_id, result, kyc_state, user_reputation,
    fraud_result, previous_reputation, response_data
"#;

/// Store backed by the tables in `migrations/`.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn decode_err(what: &str, e: String) -> AppError {
    AppError::InternalError(format!("Stored {} is invalid: {}", what, e))
}

fn user_from_row(row: &PgRow) -> Result<User, AppError> {
    let state: String = row.try_get("state")?;
    let decline_reason: Option<String> = row.try_get("decline_reason")?;

    Ok(User {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        email: row.try_get("email")?,
        eth_address: row.try_get("eth_address")?,
        eth_amount: row.try_get("eth_amount")?,
        eth_cap: row.try_get("eth_cap")?,
        telegram: row.try_get("telegram")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        dob: row.try_get("dob")?,
        phone: row.try_get("phone")?,
        address: row.try_get("address")?,
        city: row.try_get("city")?,
        state_code: row.try_get("state_code")?,
        zip_code: row.try_get("zip_code")?,
        country_code: row.try_get("country_code")?,
        ip: row.try_get("ip")?,
        ip_country: row.try_get("ip_country")?,
        dfp: row.try_get("dfp")?,
        confirmed_location: row.try_get("confirmed_location")?,
        socials: SocialHandles {
            medium: row.try_get("medium")?,
            reddit: row.try_get("reddit")?,
            twitter: row.try_get("twitter")?,
            linkedin: row.try_get("linkedin")?,
            facebook: row.try_get("facebook")?,
        },
        state: state.parse().map_err(|e| decode_err("state", e))?,
        decline_reason: decline_reason
            .map(|r| r.parse::<DeclineReason>())
            .transpose()
            .map_err(|e| decode_err("decline reason", e))?,
        info: row.try_get("info")?,
        idm_tid: row.try_get("idm_tid")?,
        kyc_result: row.try_get("kyc_result")?,
        idm_result: row.try_get("idm_result")?,
        doc_type: row.try_get("doc_type")?,
        onfido_id: row.try_get("onfido_id")?,
        onfido_status: row.try_get("onfido_status")?,
        contribution_amount: row.try_get("contribution_amount")?,
        contribution_tx: row.try_get("contribution_tx")?,
    })
}

fn stage_from_row(row: &PgRow) -> Result<VerificationStage, AppError> {
    let stage: i16 = row.try_get("stage")?;
    VerificationStage::from_number(stage).ok_or_else(|| decode_err("stage", stage.to_string()))
}

fn request_from_row(row: &PgRow) -> Result<VerificationRequest, AppError> {
    Ok(VerificationRequest {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        stage: stage_from_row(row)?,
        created_at: row.try_get("created_at")?,
        requested_at: row.try_get("requested_at")?,
        transaction_id: row.try_get("transaction_id")?,
        request_data: row.try_get("request_data")?,
        response_status: row.try_get("response_status")?,
    })
}

fn check_from_row(row: &PgRow) -> Result<CheckResource, AppError> {
    Ok(CheckResource {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        status: row.try_get("status")?,
        name: row.try_get("name")?,
        result: row.try_get("result")?,
        sub_result: row.try_get("sub_result")?,
        reports: row.try_get("reports")?,
        raw: row.try_get("raw")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn insert_user(&self, new_user: NewUser) -> Result<User, AppError> {
        let sql = format!(
            r#"
            INSERT INTO users (
                id, email, eth_address, eth_amount, telegram, first_name, last_name,
                dob, phone, address, city, state_code, zip_code, country_code,
                ip, ip_country, dfp, confirmed_location,
                medium, reddit, twitter, linkedin, facebook, state
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)
            RETURNING {}
            "#,
            USER_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&new_user.email)
            .bind(&new_user.eth_address)
            .bind(&new_user.eth_amount)
            .bind(&new_user.telegram)
            .bind(&new_user.first_name)
            .bind(&new_user.last_name)
            .bind(new_user.dob)
            .bind(&new_user.phone)
            .bind(&new_user.address)
            .bind(&new_user.city)
            .bind(&new_user.state_code)
            .bind(&new_user.zip_code)
            .bind(&new_user.country_code)
            .bind(&new_user.ip)
            .bind(&new_user.ip_country)
            .bind(&new_user.dfp)
            .bind(new_user.confirmed_location)
            .bind(&new_user.socials.medium)
            .bind(&new_user.socials.reddit)
            .bind(&new_user.socials.twitter)
            .bind(&new_user.socials.linkedin)
            .bind(&new_user.socials.facebook)
            .bind(UserState::NewUser.as_str())
            .fetch_one(&self.pool)
            .await
            .context("inserting user")?;

        user_from_row(&row)
    }

    async fn find_user(&self, key: &LookupKey) -> Result<Option<User>, AppError> {
        let column = match key {
            LookupKey::Id(_) => "id",
            LookupKey::Email(_) => "email",
            LookupKey::EthAddress(_) => "eth_address",
            LookupKey::Telegram(_) => "telegram",
        };
        let sql = format!("SELECT {} FROM users WHERE {} = $1", USER_COLUMNS, column);

        let query = sqlx::query(&sql);
        let query = match key {
            LookupKey::Id(id) => query.bind(*id),
            LookupKey::Email(value) | LookupKey::EthAddress(value) | LookupKey::Telegram(value) => {
                query.bind(value.as_str())
            }
        };

        query
            .fetch_optional(&self.pool)
            .await?
            .map(|row| user_from_row(&row))
            .transpose()
    }

    async fn compare_and_set_state(
        &self,
        user_id: Uuid,
        update: StateUpdate,
    ) -> Result<bool, AppError> {
        // Mirrors apply_state_update: reasons persist only on final states,
        // detail overwrites info when present.
        let result = sqlx::query(
            r#"
            UPDATE users
            SET state = $3,
                decline_reason = CASE WHEN $4 THEN COALESCE($5, decline_reason) ELSE NULL END,
                info = COALESCE($6, info)
            WHERE id = $1 AND state = $2
            "#,
        )
        .bind(user_id)
        .bind(update.expected.as_str())
        .bind(update.target.as_str())
        .bind(update.target.is_final())
        .bind(update.decline_reason.map(|r| r.as_str()))
        .bind(&update.detail)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        // Distinguish a lost race from a missing user.
        self.get_user(user_id).await?;
        Ok(false)
    }

    async fn set_stage_result(
        &self,
        user_id: Uuid,
        stage: VerificationStage,
        value: Option<String>,
    ) -> Result<(), AppError> {
        let sql = match stage {
            VerificationStage::Info => "UPDATE users SET kyc_result = $2 WHERE id = $1",
            VerificationStage::Id => "UPDATE users SET idm_result = $2 WHERE id = $1",
        };
        sqlx::query(sql)
            .bind(user_id)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn claim_transaction_id(
        &self,
        user_id: Uuid,
        candidate: &str,
    ) -> Result<String, AppError> {
        let row = sqlx::query(
            "UPDATE users SET idm_tid = COALESCE(idm_tid, $2) WHERE id = $1 RETURNING idm_tid",
        )
        .bind(user_id)
        .bind(candidate)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("User {} not found", user_id)))?;

        Ok(row.try_get("idm_tid")?)
    }

    async fn set_doc_type(&self, user_id: Uuid, doc_type: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE users SET doc_type = $2 WHERE id = $1")
            .bind(user_id)
            .bind(doc_type)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_onfido_id(&self, user_id: Uuid, applicant_id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE users SET onfido_id = $2 WHERE id = $1")
            .bind(user_id)
            .bind(applicant_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_onfido_status(
        &self,
        user_id: Uuid,
        status: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query("UPDATE users SET onfido_status = $2 WHERE id = $1")
            .bind(user_id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_users_in_state(&self, state: UserState) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE state = $1")
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn insert_request(&self, request: &VerificationRequest) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO verification_requests
                (id, user_id, stage, created_at, requested_at, transaction_id, request_data, response_status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(request.id)
        .bind(request.user_id)
        .bind(request.stage.number())
        .bind(request.created_at)
        .bind(request.requested_at)
        .bind(&request.transaction_id)
        .bind(&request.request_data)
        .bind(request.response_status)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting request {}", request.transaction_id))?;
        Ok(())
    }

    async fn mark_request_completed(
        &self,
        request_id: Uuid,
        requested_at: DateTime<Utc>,
        response_status: Option<i32>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE verification_requests SET requested_at = $2, response_status = $3 WHERE id = $1",
        )
        .bind(request_id)
        .bind(requested_at)
        .bind(response_status)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Request {} not found", request_id)));
        }
        Ok(())
    }

    async fn find_request_by_transaction(
        &self,
        transaction_id: &str,
    ) -> Result<Option<VerificationRequest>, AppError> {
        let sql = format!(
            "SELECT {} FROM verification_requests WHERE transaction_id = $1 ORDER BY created_at DESC LIMIT 1",
            REQUEST_COLUMNS
        );
        sqlx::query(&sql)
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| request_from_row(&row))
            .transpose()
    }

    async fn insert_response(&self, response: &VerificationResponse) -> Result<(), AppError> {
        let sql = format!(
            "INSERT INTO verification_responses ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            RESPONSE_COLUMNS
        );
        sqlx::query(&sql)
            .bind(response.id)
            .bind(response.user_id)
            .bind(response.received_at)
            .bind(&response.transaction_id)
            .bind(&response.result)
            .bind(&response.kyc_state)
            .bind(&response.user_reputation)
            .bind(&response.fraud_result)
            .bind(&response.previous_reputation)
            .bind(&response.response_data)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_upload(&self, upload: &Upload) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO uploads (id, user_id, content_type, original_filename, size, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(upload.id)
        .bind(upload.user_id)
        .bind(&upload.content_type)
        .bind(&upload.original_filename)
        .bind(upload.size)
        .bind(upload.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_upload(&self, upload_id: Uuid) -> Result<Option<Upload>, AppError> {
        let row = sqlx::query(
            "SELECT id, user_id, content_type, original_filename, size, created_at FROM uploads WHERE id = $1",
        )
        .bind(upload_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<Upload, AppError> {
            Ok(Upload {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                content_type: row.try_get("content_type")?,
                original_filename: row.try_get("original_filename")?,
                size: row.try_get("size")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn insert_id_upload(&self, upload: &IdUpload) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO id_uploads (id, user_id, upload1, upload2, doc_type, doc_country, doc_state, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(upload.id)
        .bind(upload.user_id)
        .bind(upload.upload1)
        .bind(upload.upload2)
        .bind(upload.doc_type.as_str())
        .bind(&upload.doc_country)
        .bind(&upload.doc_state)
        .bind(upload.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_id_upload(&self, upload_id: Uuid) -> Result<Option<IdUpload>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, upload1, upload2, doc_type, doc_country, doc_state, created_at
            FROM id_uploads WHERE id = $1
            "#,
        )
        .bind(upload_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<IdUpload, AppError> {
            let doc_type: String = row.try_get("doc_type")?;
            Ok(IdUpload {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                upload1: row.try_get("upload1")?,
                upload2: row.try_get("upload2")?,
                doc_type: doc_type
                    .parse::<DocType>()
                    .map_err(|e| decode_err("document type", e))?,
                doc_country: row.try_get("doc_country")?,
                doc_state: row.try_get("doc_state")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn insert_webhook(&self, envelope: &WebhookEnvelope) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO webhooks (id, resource_type, action, object, payload, digest, received_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(envelope.id)
        .bind(&envelope.resource_type)
        .bind(&envelope.action)
        .bind(&envelope.object)
        .bind(&envelope.payload)
        .bind(&envelope.digest)
        .bind(envelope.received_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_check(&self, check: &CheckResource) -> Result<CheckResource, AppError> {
        let row = sqlx::query(
            r#"
            INSERT INTO checks (id, user_id, status, name, result, sub_result, reports, raw)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                user_id = COALESCE(EXCLUDED.user_id, checks.user_id),
                status = EXCLUDED.status,
                name = EXCLUDED.name,
                result = EXCLUDED.result,
                sub_result = EXCLUDED.sub_result,
                reports = EXCLUDED.reports,
                raw = EXCLUDED.raw
            RETURNING id, user_id, status, name, result, sub_result, reports, raw
            "#,
        )
        .bind(&check.id)
        .bind(check.user_id)
        .bind(&check.status)
        .bind(&check.name)
        .bind(&check.result)
        .bind(&check.sub_result)
        .bind(&check.reports)
        .bind(&check.raw)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upserting check {}", check.id))?;

        check_from_row(&row)
    }

    async fn upsert_report(&self, report: &ReportResource) -> Result<ReportResource, AppError> {
        let row = sqlx::query(
            r#"
            INSERT INTO reports (id, user_id, status, name, result, sub_result, raw)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                user_id = COALESCE(EXCLUDED.user_id, reports.user_id),
                status = EXCLUDED.status,
                name = EXCLUDED.name,
                result = EXCLUDED.result,
                sub_result = EXCLUDED.sub_result,
                raw = EXCLUDED.raw
            RETURNING id, user_id, status, name, result, sub_result, raw
            "#,
        )
        .bind(&report.id)
        .bind(report.user_id)
        .bind(&report.status)
        .bind(&report.name)
        .bind(&report.result)
        .bind(&report.sub_result)
        .bind(&report.raw)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("upserting report {}", report.id))?;

        Ok(ReportResource {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            status: row.try_get("status")?,
            name: row.try_get("name")?,
            result: row.try_get("result")?,
            sub_result: row.try_get("sub_result")?,
            raw: row.try_get("raw")?,
        })
    }

    async fn get_check(&self, check_id: &str) -> Result<Option<CheckResource>, AppError> {
        sqlx::query(
            "SELECT id, user_id, status, name, result, sub_result, reports, raw FROM checks WHERE id = $1",
        )
        .bind(check_id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| check_from_row(&row))
        .transpose()
    }

    async fn mark_check_completed(&self, check_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE checks SET completed_at = now()
            WHERE id = $1 AND completed_at IS NULL
            "#,
        )
        .bind(check_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
