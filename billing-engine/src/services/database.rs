//! Database service for billing-engine.

use crate::engine::billing_number::format_billing_number;
use crate::error::BillingError;
use crate::models::{
    AllocatedSequence, BeginRun, BillingEntity, BillingRun, BillingSchedule, CreateBillingEntity,
    CreateSchedule, Invoice, InvoiceLineItem, InvoiceStatus, InvoiceUpdate, NewInvoice,
    NewLineItem, RunOutcome, ScheduleAdvance, ScheduleStatus, ScheduleUpdate,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::settings::SettingsProvider;
use crate::services::store::BillingStore;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const ENTITY_COLUMNS: &str =
    "entity_id, name, invoice_prefix, tin, next_sequence, created_utc";

const SCHEDULE_COLUMNS: &str = "schedule_id, contract_id, billing_entity_id, customer_name, \
    customer_address, customer_emails, customer_tin, description, billing_amount, \
    amount_is_vat_inclusive, vat_policy, has_withholding, withholding_rate, withholding_code, \
    frequency, custom_interval_value, custom_interval_unit, billing_day_of_month, \
    due_day_of_month, start_date, end_date, next_billing_date, auto_approve, auto_send_enabled, \
    status, run_count, created_by, approved_by, approved_utc, rejection_reason, created_utc, \
    updated_utc, deleted_utc";

const RUN_COLUMNS: &str = "run_id, schedule_id, invoice_id, run_date, period_key, run_type, \
    status, error_message, created_utc, completed_utc";

const INVOICE_COLUMNS: &str = "invoice_id, billing_entity_id, billing_number, schedule_id, \
    contract_id, customer_name, customer_address, customer_emails, customer_tin, \
    statement_date, due_date, period_start, period_end, billing_frequency, service_fee, \
    vat_amount, gross_amount, withholding_tax, net_amount, vat_policy, has_withholding, \
    withholding_rate, withholding_code, status, approved_by, approved_utc, rejected_by, \
    rejected_utc, rejection_reason, reschedule_date, voided_by, voided_utc, void_reason, \
    email_status, sent_utc, email_message_id, email_error, paid_utc, paid_amount, \
    payment_method, payment_reference, follow_up_enabled, follow_up_count, follow_up_level, \
    last_follow_up_utc, created_by, created_utc, updated_utc";

const LINE_ITEM_COLUMNS: &str = "line_item_id, invoice_id, description, quantity, unit_price, \
    service_fee, vat_amount, withholding_tax, amount, sort_order, created_utc";

fn db_error(context: &'static str) -> impl Fn(sqlx::Error) -> BillingError {
    move |e| BillingError::persistence(context, e)
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "billing-engine"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<BillingRun, BillingError> {
        sqlx::query_as::<_, BillingRun>(&format!(
            "SELECT {} FROM billing_runs WHERE run_id = $1",
            RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get billing run"))?
        .ok_or_else(|| BillingError::NotFound(format!("billing run {}", run_id)))
    }
}

#[async_trait]
impl BillingStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error("Health check failed"))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Billing Entity Operations
    // =========================================================================

    #[instrument(skip(self, input), fields(prefix = %input.invoice_prefix))]
    async fn insert_billing_entity(
        &self,
        input: &CreateBillingEntity,
    ) -> Result<BillingEntity, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_billing_entity"])
            .start_timer();

        let entity = sqlx::query_as::<_, BillingEntity>(&format!(
            r#"
            INSERT INTO billing_entities (entity_id, name, invoice_prefix, tin)
            VALUES ($1, $2, $3, $4)
            RETURNING {}
            "#,
            ENTITY_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&input.name)
        .bind(&input.invoice_prefix)
        .bind(&input.tin)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create billing entity"))?;

        timer.observe_duration();
        info!(entity_id = %entity.entity_id, "Billing entity created");

        Ok(entity)
    }

    #[instrument(skip(self), fields(entity_id = %entity_id))]
    async fn get_billing_entity(
        &self,
        entity_id: Uuid,
    ) -> Result<Option<BillingEntity>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_billing_entity"])
            .start_timer();

        let entity = sqlx::query_as::<_, BillingEntity>(&format!(
            "SELECT {} FROM billing_entities WHERE entity_id = $1",
            ENTITY_COLUMNS
        ))
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get billing entity"))?;

        timer.observe_duration();

        Ok(entity)
    }

    #[instrument(skip(self), fields(entity_id = %entity_id))]
    async fn allocate_sequence(&self, entity_id: Uuid) -> Result<AllocatedSequence, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["allocate_sequence"])
            .start_timer();

        let row = sqlx::query_as::<_, (String, i64)>(
            r#"
            UPDATE billing_entities
            SET next_sequence = next_sequence + 1
            WHERE entity_id = $1
            RETURNING invoice_prefix, next_sequence - 1
            "#,
        )
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to allocate sequence"))?;

        timer.observe_duration();

        let (prefix, sequence) = row.ok_or(BillingError::UnknownBillingEntity(entity_id))?;
        Ok(AllocatedSequence { prefix, sequence })
    }

    // =========================================================================
    // Schedule Operations
    // =========================================================================

    #[instrument(skip(self, input), fields(contract_id = %input.contract_id))]
    async fn insert_schedule(
        &self,
        input: &CreateSchedule,
    ) -> Result<BillingSchedule, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_schedule"])
            .start_timer();

        let schedule = sqlx::query_as::<_, BillingSchedule>(&format!(
            r#"
            INSERT INTO billing_schedules (schedule_id, contract_id, billing_entity_id, customer_name, customer_address, customer_emails, customer_tin, description, billing_amount, amount_is_vat_inclusive, vat_policy, has_withholding, withholding_rate, withholding_code, frequency, custom_interval_value, custom_interval_unit, billing_day_of_month, due_day_of_month, start_date, end_date, auto_approve, auto_send_enabled, status, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25)
            RETURNING {}
            "#,
            SCHEDULE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.contract_id)
        .bind(input.billing_entity_id)
        .bind(&input.customer_name)
        .bind(&input.customer_address)
        .bind(&input.customer_emails)
        .bind(&input.customer_tin)
        .bind(&input.description)
        .bind(input.billing_amount)
        .bind(input.amount_is_vat_inclusive)
        .bind(input.vat_policy.as_str())
        .bind(input.has_withholding)
        .bind(input.withholding_rate)
        .bind(&input.withholding_code)
        .bind(input.frequency.as_str())
        .bind(input.custom_interval_value)
        .bind(input.custom_interval_unit.map(|u| u.as_str()))
        .bind(input.billing_day_of_month)
        .bind(input.due_day_of_month)
        .bind(input.start_date)
        .bind(input.end_date)
        .bind(input.auto_approve)
        .bind(input.auto_send_enabled)
        .bind(ScheduleStatus::Pending.as_str())
        .bind(input.created_by)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to create schedule"))?;

        timer.observe_duration();
        info!(schedule_id = %schedule.schedule_id, "Schedule created");

        Ok(schedule)
    }

    #[instrument(skip(self), fields(schedule_id = %schedule_id))]
    async fn get_schedule(
        &self,
        schedule_id: Uuid,
    ) -> Result<Option<BillingSchedule>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_schedule"])
            .start_timer();

        let schedule = sqlx::query_as::<_, BillingSchedule>(&format!(
            "SELECT {} FROM billing_schedules WHERE schedule_id = $1",
            SCHEDULE_COLUMNS
        ))
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get schedule"))?;

        timer.observe_duration();

        Ok(schedule)
    }

    #[instrument(skip(self), fields(as_of = %as_of))]
    async fn list_due_schedules(
        &self,
        as_of: NaiveDate,
    ) -> Result<Vec<BillingSchedule>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_due_schedules"])
            .start_timer();

        let schedules = sqlx::query_as::<_, BillingSchedule>(&format!(
            r#"
            SELECT {}
            FROM billing_schedules
            WHERE status = 'ACTIVE'
              AND deleted_utc IS NULL
              AND next_billing_date <= $1
            ORDER BY next_billing_date, created_utc
            "#,
            SCHEDULE_COLUMNS
        ))
        .bind(as_of)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list due schedules"))?;

        timer.observe_duration();

        Ok(schedules)
    }

    #[instrument(skip(self, update), fields(schedule_id = %schedule_id))]
    async fn update_schedule_state(
        &self,
        schedule_id: Uuid,
        expected: ScheduleStatus,
        update: &ScheduleUpdate,
    ) -> Result<BillingSchedule, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_schedule_state"])
            .start_timer();

        let schedule = sqlx::query_as::<_, BillingSchedule>(&format!(
            r#"
            UPDATE billing_schedules
            SET status = COALESCE($3, status),
                next_billing_date = COALESCE($4, next_billing_date),
                approved_by = COALESCE($5, approved_by),
                approved_utc = COALESCE($6, approved_utc),
                rejection_reason = COALESCE($7, rejection_reason),
                deleted_utc = COALESCE($8, deleted_utc),
                updated_utc = NOW()
            WHERE schedule_id = $1 AND status = $2
            RETURNING {}
            "#,
            SCHEDULE_COLUMNS
        ))
        .bind(schedule_id)
        .bind(expected.as_str())
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.next_billing_date)
        .bind(update.approved_by)
        .bind(update.approved_utc)
        .bind(&update.rejection_reason)
        .bind(update.deleted_utc)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to update schedule"))?;

        timer.observe_duration();

        match schedule {
            Some(schedule) => Ok(schedule),
            None => match self.get_schedule(schedule_id).await? {
                Some(current) => Err(BillingError::Conflict(format!(
                    "schedule {} is {}, expected {}",
                    schedule_id,
                    current.status,
                    expected.as_str()
                ))),
                None => Err(BillingError::NotFound(format!("schedule {}", schedule_id))),
            },
        }
    }

    #[instrument(skip(self, advance), fields(schedule_id = %schedule_id))]
    async fn advance_schedule(
        &self,
        schedule_id: Uuid,
        expected_next: NaiveDate,
        advance: &ScheduleAdvance,
    ) -> Result<bool, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["advance_schedule"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE billing_schedules
            SET next_billing_date = COALESCE($3, next_billing_date),
                status = CASE WHEN $3::date IS NULL THEN 'ENDED' ELSE status END,
                run_count = run_count + CASE WHEN $4 THEN 1 ELSE 0 END,
                updated_utc = NOW()
            WHERE schedule_id = $1
              AND next_billing_date = $2
              AND status <> 'ENDED'
            "#,
        )
        .bind(schedule_id)
        .bind(expected_next)
        .bind(advance.next_billing_date)
        .bind(advance.increment_run_count)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to advance schedule"))?;

        timer.observe_duration();

        Ok(result.rows_affected() == 1)
    }

    // =========================================================================
    // Billing Run Operations
    // =========================================================================

    #[instrument(skip(self, input), fields(schedule_id = %input.schedule_id, period_key = %input.period_key))]
    async fn begin_run(&self, input: &BeginRun) -> Result<BillingRun, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["begin_run"])
            .start_timer();

        let run = sqlx::query_as::<_, BillingRun>(&format!(
            r#"
            INSERT INTO billing_runs (run_id, schedule_id, run_date, period_key, run_type, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            RUN_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.schedule_id)
        .bind(input.run_date)
        .bind(&input.period_key)
        .bind(input.run_type.as_str())
        .bind(RunOutcome::Pending.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to begin billing run"))?;

        timer.observe_duration();

        Ok(run)
    }

    #[instrument(skip(self), fields(schedule_id = %schedule_id, period_key = %period_key))]
    async fn find_success_run(
        &self,
        schedule_id: Uuid,
        period_key: &str,
    ) -> Result<Option<BillingRun>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_success_run"])
            .start_timer();

        let run = sqlx::query_as::<_, BillingRun>(&format!(
            r#"
            SELECT {}
            FROM billing_runs
            WHERE schedule_id = $1 AND period_key = $2 AND status = 'SUCCESS'
            "#,
            RUN_COLUMNS
        ))
        .bind(schedule_id)
        .bind(period_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find successful run"))?;

        timer.observe_duration();

        Ok(run)
    }

    #[instrument(skip(self, error_message), fields(run_id = %run_id, outcome = outcome.as_str()))]
    async fn finalize_run(
        &self,
        run_id: Uuid,
        outcome: RunOutcome,
        invoice_id: Option<Uuid>,
        error_message: Option<&str>,
    ) -> Result<BillingRun, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["finalize_run"])
            .start_timer();

        let current = self.get_run(run_id).await?;
        let run = sqlx::query_as::<_, BillingRun>(&format!(
            r#"
            UPDATE billing_runs
            SET status = $2, invoice_id = $3, error_message = $4, completed_utc = NOW()
            WHERE run_id = $1 AND status = 'PENDING'
            RETURNING {}
            "#,
            RUN_COLUMNS
        ))
        .bind(run_id)
        .bind(outcome.as_str())
        .bind(invoice_id)
        .bind(error_message)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                BillingError::DuplicateRun {
                    schedule_id: current.schedule_id,
                    period_key: current.period_key.clone(),
                }
            }
            _ => BillingError::persistence("Failed to finalize billing run", e),
        })?;

        timer.observe_duration();

        run.ok_or_else(|| {
            BillingError::Conflict(format!(
                "billing run {} is already {}",
                run_id, current.status
            ))
        })
    }

    #[instrument(skip(self), fields(schedule_id = %schedule_id))]
    async fn list_runs(&self, schedule_id: Uuid) -> Result<Vec<BillingRun>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_runs"])
            .start_timer();

        let runs = sqlx::query_as::<_, BillingRun>(&format!(
            r#"
            SELECT {}
            FROM billing_runs
            WHERE schedule_id = $1
            ORDER BY created_utc DESC
            "#,
            RUN_COLUMNS
        ))
        .bind(schedule_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list billing runs"))?;

        timer.observe_duration();

        Ok(runs)
    }

    // =========================================================================
    // Invoice Operations
    // =========================================================================

    #[instrument(skip(self, input, line_items), fields(entity_id = %input.billing_entity_id))]
    async fn create_invoice(
        &self,
        input: &NewInvoice,
        line_items: &[NewLineItem],
        run_id: Option<Uuid>,
    ) -> Result<Invoice, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        let run = match run_id {
            Some(run_id) => Some(self.get_run(run_id).await?),
            None => None,
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        let (prefix, sequence) = sqlx::query_as::<_, (String, i64)>(
            r#"
            UPDATE billing_entities
            SET next_sequence = next_sequence + 1
            WHERE entity_id = $1
            RETURNING invoice_prefix, next_sequence - 1
            "#,
        )
        .bind(input.billing_entity_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to allocate billing number"))?
        .ok_or(BillingError::UnknownBillingEntity(input.billing_entity_id))?;

        let billing_number =
            format_billing_number(&prefix, input.statement_date.year(), sequence);

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            INSERT INTO invoices (invoice_id, billing_entity_id, billing_number, schedule_id, contract_id, customer_name, customer_address, customer_emails, customer_tin, statement_date, due_date, period_start, period_end, billing_frequency, service_fee, vat_amount, gross_amount, withholding_tax, net_amount, vat_policy, has_withholding, withholding_rate, withholding_code, status, approved_utc, follow_up_enabled, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27)
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.billing_entity_id)
        .bind(&billing_number)
        .bind(input.schedule_id)
        .bind(input.contract_id)
        .bind(&input.customer_name)
        .bind(&input.customer_address)
        .bind(&input.customer_emails)
        .bind(&input.customer_tin)
        .bind(input.statement_date)
        .bind(input.due_date)
        .bind(input.period_start)
        .bind(input.period_end)
        .bind(input.billing_frequency.map(|f| f.as_str()))
        .bind(input.service_fee)
        .bind(input.vat_amount)
        .bind(input.gross_amount)
        .bind(input.withholding_tax)
        .bind(input.net_amount)
        .bind(input.vat_policy.as_str())
        .bind(input.has_withholding)
        .bind(input.withholding_rate)
        .bind(&input.withholding_code)
        .bind(input.status.as_str())
        .bind(input.approved_utc)
        .bind(input.follow_up_enabled)
        .bind(input.created_by)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to create invoice"))?;

        for line in line_items {
            sqlx::query(
                r#"
                INSERT INTO invoice_line_items (line_item_id, invoice_id, description, quantity, unit_price, service_fee, vat_amount, withholding_tax, amount, sort_order)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(invoice.invoice_id)
            .bind(&line.description)
            .bind(line.quantity)
            .bind(line.unit_price)
            .bind(line.service_fee)
            .bind(line.vat_amount)
            .bind(line.withholding_tax)
            .bind(line.amount)
            .bind(line.sort_order)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to create invoice line item"))?;
        }

        if let Some(run) = &run {
            // The partial unique index on (schedule_id, period_key) WHERE
            // status = 'SUCCESS' rejects a second successful run.
            let result = sqlx::query(
                r#"
                UPDATE billing_runs
                SET status = 'SUCCESS', invoice_id = $2, completed_utc = NOW()
                WHERE run_id = $1 AND status = 'PENDING'
                "#,
            )
            .bind(run.run_id)
            .bind(invoice.invoice_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    BillingError::DuplicateRun {
                        schedule_id: run.schedule_id,
                        period_key: run.period_key.clone(),
                    }
                }
                _ => BillingError::persistence("Failed to complete billing run", e),
            })?;

            if result.rows_affected() != 1 {
                return Err(BillingError::Conflict(format!(
                    "billing run {} is no longer pending",
                    run.run_id
                )));
            }
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit invoice"))?;

        timer.observe_duration();
        info!(
            invoice_id = %invoice.invoice_id,
            billing_number = %invoice.billing_number,
            "Invoice created"
        );

        Ok(invoice)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn get_invoice(&self, invoice_id: Uuid) -> Result<Option<Invoice>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE invoice_id = $1",
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get invoice"))?;

        timer.observe_duration();

        Ok(invoice)
    }

    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    async fn get_line_items(
        &self,
        invoice_id: Uuid,
    ) -> Result<Vec<InvoiceLineItem>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_line_items"])
            .start_timer();

        let lines = sqlx::query_as::<_, InvoiceLineItem>(&format!(
            "SELECT {} FROM invoice_line_items WHERE invoice_id = $1 ORDER BY sort_order",
            LINE_ITEM_COLUMNS
        ))
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to get invoice line items"))?;

        timer.observe_duration();

        Ok(lines)
    }

    #[instrument(skip(self), fields(schedule_id = %schedule_id))]
    async fn list_invoices_for_schedule(
        &self,
        schedule_id: Uuid,
    ) -> Result<Vec<Invoice>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_invoices_for_schedule"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE schedule_id = $1 ORDER BY statement_date",
            INVOICE_COLUMNS
        ))
        .bind(schedule_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list invoices"))?;

        timer.observe_duration();

        Ok(invoices)
    }

    #[instrument(skip(self, update), fields(invoice_id = %invoice_id))]
    async fn update_invoice_state(
        &self,
        invoice_id: Uuid,
        expected: InvoiceStatus,
        update: &InvoiceUpdate,
    ) -> Result<Invoice, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_invoice_state"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            UPDATE invoices
            SET status = COALESCE($3, status),
                approved_by = COALESCE($4, approved_by),
                approved_utc = COALESCE($5, approved_utc),
                rejected_by = COALESCE($6, rejected_by),
                rejected_utc = COALESCE($7, rejected_utc),
                rejection_reason = COALESCE($8, rejection_reason),
                reschedule_date = COALESCE($9, reschedule_date),
                voided_by = COALESCE($10, voided_by),
                voided_utc = COALESCE($11, voided_utc),
                void_reason = COALESCE($12, void_reason),
                email_status = COALESCE($13, email_status),
                sent_utc = COALESCE($14, sent_utc),
                email_message_id = COALESCE($15, email_message_id),
                email_error = CASE WHEN $24 THEN NULL ELSE COALESCE($16, email_error) END,
                paid_utc = COALESCE($17, paid_utc),
                paid_amount = COALESCE($18, paid_amount),
                payment_method = COALESCE($19, payment_method),
                payment_reference = COALESCE($20, payment_reference),
                follow_up_count = COALESCE($21, follow_up_count),
                follow_up_level = COALESCE($22, follow_up_level),
                last_follow_up_utc = COALESCE($23, last_follow_up_utc),
                updated_utc = NOW()
            WHERE invoice_id = $1 AND status = $2
            RETURNING {}
            "#,
            INVOICE_COLUMNS
        ))
        .bind(invoice_id)
        .bind(expected.as_str())
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.approved_by)
        .bind(update.approved_utc)
        .bind(update.rejected_by)
        .bind(update.rejected_utc)
        .bind(&update.rejection_reason)
        .bind(update.reschedule_date)
        .bind(update.voided_by)
        .bind(update.voided_utc)
        .bind(&update.void_reason)
        .bind(update.email_status.map(|s| s.as_str()))
        .bind(update.sent_utc)
        .bind(&update.email_message_id)
        .bind(&update.email_error)
        .bind(update.paid_utc)
        .bind(update.paid_amount)
        .bind(&update.payment_method)
        .bind(&update.payment_reference)
        .bind(update.follow_up_count)
        .bind(update.follow_up_level)
        .bind(update.last_follow_up_utc)
        .bind(update.clear_email_error)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to update invoice"))?;

        timer.observe_duration();

        match invoice {
            Some(invoice) => Ok(invoice),
            None => match self.get_invoice(invoice_id).await? {
                Some(current) => Err(BillingError::Conflict(format!(
                    "invoice {} is {}, expected {}",
                    invoice_id,
                    current.status,
                    expected.as_str()
                ))),
                None => Err(BillingError::NotFound(format!("invoice {}", invoice_id))),
            },
        }
    }
}

#[async_trait]
impl SettingsProvider for Database {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<String>, BillingError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_setting"])
            .start_timer();

        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to read setting"))?;

        timer.observe_duration();

        Ok(value)
    }
}
