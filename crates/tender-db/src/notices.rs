//! Notice repository implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use pgvector::Vector;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use tender_core::{
    AttachmentSignature, Error, IngestPlan, IngestReport, Notice, NoticeAttachment,
    NoticeRepository, NoticeSnapshot, NoticeVersion, Result, StoredAttachment, VectorCandidate,
};

const NOTICE_COLUMNS: &str = "id, external_id, source, document_type, region, period, \
    entry_name, version_number, purchase_number, document_number, publish_date, href, \
    placing_way_code, placing_way_name, etp_code, etp_name, etp_url, \
    contract_conclusion_on_st83_ch2, purchase_object_info, max_price, currency_code, \
    okpd2_code, okpd2_name, kvr_code, kvr_name, collecting_end, created_at, updated_at";

/// Version columns with the raw payload left out; snapshots only need the hash.
const VERSION_COLUMNS_LIGHT: &str = "id, notice_id, external_id, version_number, is_active, \
    version_received_at, ''::bytea AS raw_content, hash, inserted_at, last_seen_at, \
    source_file_name";

const ATTACHMENT_COLUMNS: &str = "a.id, a.notice_version_id, a.published_content_id, \
    a.file_name, a.file_size, a.description, a.document_date, a.document_kind_code, \
    a.document_kind_name, a.url, a.inserted_at, a.last_seen_at, a.source_file_name";

/// PostgreSQL implementation of NoticeRepository.
#[derive(Clone)]
pub struct PgNoticeRepository {
    pool: PgPool,
}

impl PgNoticeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_attachments(&self, filter: &str, id: Uuid) -> Result<Vec<StoredAttachment>> {
        let attachments: Vec<NoticeAttachment> = sqlx::query_as(&format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM notice_attachment a \
             JOIN notice_version v ON v.id = a.notice_version_id \
             WHERE {filter} = $1 ORDER BY a.published_content_id"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let signatures: Vec<AttachmentSignature> = sqlx::query_as(&format!(
            "SELECT s.id, s.attachment_id, s.signature_type, s.signature_value \
             FROM attachment_signature s \
             JOIN notice_attachment a ON a.id = s.attachment_id \
             JOIN notice_version v ON v.id = a.notice_version_id \
             WHERE {filter} = $1"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut by_attachment: HashMap<Uuid, Vec<AttachmentSignature>> = HashMap::new();
        for signature in signatures {
            by_attachment
                .entry(signature.attachment_id)
                .or_default()
                .push(signature);
        }

        Ok(attachments
            .into_iter()
            .map(|attachment| StoredAttachment {
                signatures: by_attachment.remove(&attachment.id).unwrap_or_default(),
                attachment,
            })
            .collect())
    }

    async fn upsert_notice(tx: &mut Transaction<'_, Postgres>, n: &Notice) -> Result<(Uuid, bool)> {
        let row = sqlx::query(
            r#"
            INSERT INTO notice (
                id, external_id, source, document_type, region, period, entry_name,
                version_number, purchase_number, document_number, publish_date, href,
                placing_way_code, placing_way_name, etp_code, etp_name, etp_url,
                contract_conclusion_on_st83_ch2, purchase_object_info, max_price,
                currency_code, okpd2_code, okpd2_name, kvr_code, kvr_name, collecting_end,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28)
            ON CONFLICT (external_id) DO UPDATE SET
                source = EXCLUDED.source,
                document_type = EXCLUDED.document_type,
                region = EXCLUDED.region,
                period = EXCLUDED.period,
                entry_name = EXCLUDED.entry_name,
                version_number = EXCLUDED.version_number,
                purchase_number = EXCLUDED.purchase_number,
                document_number = EXCLUDED.document_number,
                publish_date = EXCLUDED.publish_date,
                href = EXCLUDED.href,
                placing_way_code = EXCLUDED.placing_way_code,
                placing_way_name = EXCLUDED.placing_way_name,
                etp_code = EXCLUDED.etp_code,
                etp_name = EXCLUDED.etp_name,
                etp_url = EXCLUDED.etp_url,
                contract_conclusion_on_st83_ch2 = EXCLUDED.contract_conclusion_on_st83_ch2,
                purchase_object_info = EXCLUDED.purchase_object_info,
                max_price = EXCLUDED.max_price,
                currency_code = EXCLUDED.currency_code,
                okpd2_code = EXCLUDED.okpd2_code,
                okpd2_name = EXCLUDED.okpd2_name,
                kvr_code = EXCLUDED.kvr_code,
                kvr_name = EXCLUDED.kvr_name,
                collecting_end = EXCLUDED.collecting_end,
                updated_at = EXCLUDED.updated_at
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(n.id)
        .bind(&n.external_id)
        .bind(&n.source)
        .bind(&n.document_type)
        .bind(n.region)
        .bind(n.period)
        .bind(&n.entry_name)
        .bind(n.version_number)
        .bind(&n.purchase_number)
        .bind(&n.document_number)
        .bind(n.publish_date)
        .bind(&n.href)
        .bind(&n.placing_way_code)
        .bind(&n.placing_way_name)
        .bind(&n.etp_code)
        .bind(&n.etp_name)
        .bind(&n.etp_url)
        .bind(n.contract_conclusion_on_st83_ch2)
        .bind(&n.purchase_object_info)
        .bind(n.max_price)
        .bind(&n.currency_code)
        .bind(&n.okpd2_code)
        .bind(&n.okpd2_name)
        .bind(&n.kvr_code)
        .bind(&n.kvr_name)
        .bind(n.collecting_end)
        .bind(n.created_at)
        .bind(n.updated_at)
        .fetch_one(&mut **tx)
        .await
        .map_err(Error::Database)?;

        Ok((row.get("id"), row.get("inserted")))
    }

    async fn upsert_version(
        tx: &mut Transaction<'_, Postgres>,
        notice_id: Uuid,
        v: &NoticeVersion,
    ) -> Result<(Uuid, bool)> {
        let row = sqlx::query(
            r#"
            INSERT INTO notice_version (
                id, notice_id, external_id, version_number, is_active, version_received_at,
                raw_content, hash, inserted_at, last_seen_at, source_file_name
            )
            VALUES ($1, $2, $3, $4, FALSE, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (notice_id, version_number) DO UPDATE SET
                version_received_at = EXCLUDED.version_received_at,
                raw_content = EXCLUDED.raw_content,
                hash = EXCLUDED.hash,
                last_seen_at = EXCLUDED.last_seen_at,
                source_file_name = EXCLUDED.source_file_name
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(v.id)
        .bind(notice_id)
        .bind(&v.external_id)
        .bind(v.version_number)
        .bind(v.version_received_at)
        .bind(&v.raw_content)
        .bind(&v.hash)
        .bind(v.inserted_at)
        .bind(v.last_seen_at)
        .bind(&v.source_file_name)
        .fetch_one(&mut **tx)
        .await
        .map_err(Error::Database)?;

        Ok((row.get("id"), row.get("inserted")))
    }

    async fn insert_signatures(
        tx: &mut Transaction<'_, Postgres>,
        attachment_id: Uuid,
        signatures: &[AttachmentSignature],
    ) -> Result<()> {
        for signature in signatures {
            sqlx::query(
                "INSERT INTO attachment_signature (id, attachment_id, signature_type, signature_value) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (attachment_id, signature_type, signature_value) DO NOTHING",
            )
            .bind(signature.id)
            .bind(attachment_id)
            .bind(&signature.signature_type)
            .bind(&signature.signature_value)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        }
        Ok(())
    }
}

#[async_trait]
impl NoticeRepository for PgNoticeRepository {
    async fn version_hash_exists(&self, hash: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM notice_version WHERE hash = $1)")
                .bind(hash)
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(exists)
    }

    async fn load_snapshot(&self, external_id: &str) -> Result<NoticeSnapshot> {
        let notice: Option<Notice> = sqlx::query_as(&format!(
            "SELECT {NOTICE_COLUMNS} FROM notice WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        let Some(notice) = notice else {
            return Ok(NoticeSnapshot::default());
        };

        let versions: Vec<NoticeVersion> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS_LIGHT} FROM notice_version \
             WHERE notice_id = $1 ORDER BY version_number"
        ))
        .bind(notice.id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let attachments = self.load_attachments("v.notice_id", notice.id).await?;

        Ok(NoticeSnapshot {
            notice: Some(notice),
            versions,
            attachments,
        })
    }

    async fn apply(&self, plan: IngestPlan) -> Result<IngestReport> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let (notice_id, notice_created) = Self::upsert_notice(&mut tx, &plan.notice).await?;
        let (version_id, version_created) =
            Self::upsert_version(&mut tx, notice_id, &plan.version).await?;

        if plan.version.is_active {
            if plan.deactivate_siblings {
                sqlx::query(
                    "UPDATE notice_version SET is_active = FALSE \
                     WHERE notice_id = $1 AND id <> $2 AND is_active",
                )
                .bind(notice_id)
                .bind(version_id)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
            }
            sqlx::query("UPDATE notice_version SET is_active = TRUE WHERE id = $1")
                .bind(version_id)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
        }

        if let Some(window) = &plan.procedure_window {
            sqlx::query(
                r#"
                INSERT INTO procedure_window (
                    notice_version_id, collecting_start, collecting_end,
                    bidding_date_raw, summarizing_date_raw
                )
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (notice_version_id) DO UPDATE SET
                    collecting_start = EXCLUDED.collecting_start,
                    collecting_end = EXCLUDED.collecting_end,
                    bidding_date_raw = EXCLUDED.bidding_date_raw,
                    summarizing_date_raw = EXCLUDED.summarizing_date_raw
                "#,
            )
            .bind(version_id)
            .bind(window.collecting_start)
            .bind(window.collecting_end)
            .bind(&window.bidding_date_raw)
            .bind(&window.summarizing_date_raw)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        let changes = &plan.attachments;
        if !changes.delete.is_empty() {
            sqlx::query("DELETE FROM attachment_signature WHERE attachment_id = ANY($1)")
                .bind(&changes.delete)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
            sqlx::query("DELETE FROM notice_attachment WHERE id = ANY($1)")
                .bind(&changes.delete)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
        }

        for update in &changes.update {
            let a = &update.attachment;
            sqlx::query(
                r#"
                UPDATE notice_attachment SET
                    notice_version_id = $2, file_name = $3, file_size = $4, description = $5,
                    document_date = $6, document_kind_code = $7, document_kind_name = $8,
                    url = $9, last_seen_at = $10, source_file_name = $11
                WHERE id = $1
                "#,
            )
            .bind(a.id)
            .bind(version_id)
            .bind(&a.file_name)
            .bind(a.file_size)
            .bind(&a.description)
            .bind(a.document_date)
            .bind(&a.document_kind_code)
            .bind(&a.document_kind_name)
            .bind(&a.url)
            .bind(a.last_seen_at)
            .bind(&a.source_file_name)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

            if !update.delete_signatures.is_empty() {
                sqlx::query("DELETE FROM attachment_signature WHERE id = ANY($1)")
                    .bind(&update.delete_signatures)
                    .execute(&mut *tx)
                    .await
                    .map_err(Error::Database)?;
            }
            Self::insert_signatures(&mut tx, a.id, &update.insert_signatures).await?;
        }

        for stored in &changes.insert {
            let a = &stored.attachment;
            sqlx::query(
                r#"
                INSERT INTO notice_attachment (
                    id, notice_version_id, published_content_id, file_name, file_size,
                    description, document_date, document_kind_code, document_kind_name, url,
                    inserted_at, last_seen_at, source_file_name
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(a.id)
            .bind(version_id)
            .bind(&a.published_content_id)
            .bind(&a.file_name)
            .bind(a.file_size)
            .bind(&a.description)
            .bind(a.document_date)
            .bind(&a.document_kind_code)
            .bind(&a.document_kind_name)
            .bind(&a.url)
            .bind(a.inserted_at)
            .bind(a.last_seen_at)
            .bind(&a.source_file_name)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
            Self::insert_signatures(&mut tx, a.id, &stored.signatures).await?;
        }

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "notices",
            op = "apply",
            notice_id = %notice_id,
            version_id = %version_id,
            notice_created,
            version_created,
            "Ingest plan committed"
        );

        Ok(IngestReport {
            notice_id,
            version_id,
            notice_created,
            version_created,
            version_active: plan.version.is_active,
            attachments_inserted: changes.insert.len(),
            attachments_updated: changes.update.len(),
            attachments_deleted: changes.delete.len(),
        })
    }

    async fn get(&self, notice_id: Uuid) -> Result<Option<Notice>> {
        sqlx::query_as(&format!("SELECT {NOTICE_COLUMNS} FROM notice WHERE id = $1"))
            .bind(notice_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)
    }

    async fn active_version(&self, notice_id: Uuid) -> Result<Option<NoticeVersion>> {
        sqlx::query_as(
            "SELECT id, notice_id, external_id, version_number, is_active, version_received_at, \
             raw_content, hash, inserted_at, last_seen_at, source_file_name \
             FROM notice_version WHERE notice_id = $1 AND is_active",
        )
        .bind(notice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)
    }

    async fn attachments(&self, notice_version_id: Uuid) -> Result<Vec<StoredAttachment>> {
        self.load_attachments("v.id", notice_version_id).await
    }

    async fn missing_vectors(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<VectorCandidate>> {
        sqlx::query_as(
            "SELECT id, purchase_object_info AS text FROM notice \
             WHERE vector IS NULL \
               AND purchase_object_info IS NOT NULL AND purchase_object_info <> '' \
               AND ($1::uuid IS NULL OR id > $1) \
             ORDER BY id LIMIT $2",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)
    }

    async fn set_vector(&self, notice_id: Uuid, vector: Vec<f32>) -> Result<bool> {
        let result = sqlx::query("UPDATE notice SET vector = $2 WHERE id = $1")
            .bind(notice_id)
            .bind(Vector::from(vector))
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }
}
