//! Email delivery and document rendering collaborators.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use lettre::{
    message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::observability::inject_trace_context;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::{RendererConfig, SmtpConfig};
use crate::error::BillingError;
use crate::models::{DeliveryResult, Invoice, InvoiceLineItem};

/// A rendered file attached to an email.
#[derive(Debug, Clone)]
pub struct EmailAttachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub to: Vec<String>,
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
    pub attachment: Option<EmailAttachment>,
}

/// Sends an email and reports the outcome. Transport failures are reported in
/// the result, not as errors.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> DeliveryResult;
    fn is_enabled(&self) -> bool;
}

/// Produces the PDF attached to an invoice email.
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render(&self, document: &InvoiceDocument) -> Result<Vec<u8>, BillingError>;
}

/// Structured invoice data handed to the renderer. Layout is the renderer's
/// concern.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceDocument {
    pub invoice_id: Uuid,
    pub billing_number: String,
    pub customer_name: String,
    pub customer_address: Option<String>,
    pub customer_tin: Option<String>,
    pub statement_date: NaiveDate,
    pub due_date: NaiveDate,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub service_fee: Decimal,
    pub vat_amount: Decimal,
    pub gross_amount: Decimal,
    pub withholding_tax: Decimal,
    pub net_amount: Decimal,
    pub lines: Vec<DocumentLine>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentLine {
    pub description: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub amount: Decimal,
}

impl InvoiceDocument {
    pub fn new(invoice: &Invoice, lines: &[InvoiceLineItem]) -> Self {
        Self {
            invoice_id: invoice.invoice_id,
            billing_number: invoice.billing_number.clone(),
            customer_name: invoice.customer_name.clone(),
            customer_address: invoice.customer_address.clone(),
            customer_tin: invoice.customer_tin.clone(),
            statement_date: invoice.statement_date,
            due_date: invoice.due_date,
            period_start: invoice.period_start,
            period_end: invoice.period_end,
            service_fee: invoice.service_fee,
            vat_amount: invoice.vat_amount,
            gross_amount: invoice.gross_amount,
            withholding_tax: invoice.withholding_tax,
            net_amount: invoice.net_amount,
            lines: lines
                .iter()
                .map(|l| DocumentLine {
                    description: l.description.clone(),
                    quantity: l.quantity,
                    unit_price: l.unit_price,
                    amount: l.amount,
                })
                .collect(),
        }
    }
}

// =============================================================================
// SMTP
// =============================================================================

pub struct SmtpEmailSender {
    config: SmtpConfig,
    transport: Option<AsyncSmtpTransport<Tokio1Executor>>,
}

impl SmtpEmailSender {
    pub fn new(config: SmtpConfig) -> Result<Self, BillingError> {
        if !config.enabled {
            return Ok(Self {
                config,
                transport: None,
            });
        }

        let creds = Credentials::new(config.user.clone(), config.password.clone());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| {
                BillingError::Configuration(format!("Failed to create SMTP relay: {}", e))
            })?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self {
            config,
            transport: Some(transport),
        })
    }

    fn build_message(&self, email: &OutgoingEmail) -> Result<Message, String> {
        let from: Mailbox = format!("{} <{}>", self.config.from_name, self.config.from_email)
            .parse()
            .map_err(|e| format!("Invalid from address: {}", e))?;

        let mut builder = Message::builder().from(from).subject(&email.subject);
        for to in &email.to {
            let mailbox: Mailbox = to
                .parse()
                .map_err(|e| format!("Invalid recipient {}: {}", to, e))?;
            builder = builder.to(mailbox);
        }

        let body = MultiPart::alternative()
            .singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_PLAIN)
                    .body(email.body_text.clone()),
            )
            .singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_HTML)
                    .body(email.body_html.clone()),
            );

        let message = match &email.attachment {
            Some(file) => {
                let content_type = ContentType::parse(&file.content_type)
                    .map_err(|e| format!("Invalid attachment type: {}", e))?;
                builder.multipart(
                    MultiPart::mixed()
                        .multipart(body)
                        .singlepart(
                            Attachment::new(file.filename.clone())
                                .body(file.bytes.clone(), content_type),
                        ),
                )
            }
            None => builder.multipart(body),
        };

        message.map_err(|e| format!("Failed to build message: {}", e))
    }
}

#[async_trait]
impl EmailSender for SmtpEmailSender {
    async fn send(&self, email: &OutgoingEmail) -> DeliveryResult {
        let Some(transport) = self.transport.as_ref() else {
            return DeliveryResult::failed("SMTP email sender is not enabled");
        };

        let message = match self.build_message(email) {
            Ok(message) => message,
            Err(e) => return DeliveryResult::failed(e),
        };

        match transport.send(message).await {
            Ok(response) => {
                let message_id = response.message().next().map(|s| s.to_string());
                info!(
                    recipients = email.to.len(),
                    subject = %email.subject,
                    "Email sent successfully"
                );
                DeliveryResult::delivered(message_id)
            }
            Err(e) => DeliveryResult::failed(format!("Failed to send email: {}", e)),
        }
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

/// In-process email sender for tests. Records what it would send.
pub struct MockEmailSender {
    fail_with: Mutex<Option<String>>,
    send_count: AtomicU64,
    sent: Mutex<Vec<OutgoingEmail>>,
}

impl MockEmailSender {
    pub fn new() -> Self {
        Self {
            fail_with: Mutex::new(None),
            send_count: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// A sender whose every delivery fails with `error`.
    pub fn failing(error: &str) -> Self {
        Self {
            fail_with: Mutex::new(Some(error.to_string())),
            ..Self::new()
        }
    }

    /// Make subsequent deliveries succeed.
    pub fn recover(&self) {
        if let Ok(mut fail_with) = self.fail_with.lock() {
            *fail_with = None;
        }
    }

    pub fn send_count(&self) -> u64 {
        self.send_count.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Default for MockEmailSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmailSender for MockEmailSender {
    async fn send(&self, email: &OutgoingEmail) -> DeliveryResult {
        let failure = self.fail_with.lock().ok().and_then(|f| f.clone());
        if let Some(error) = failure {
            return DeliveryResult::failed(error);
        }
        let count = self.send_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(email.clone());
        }
        info!(subject = %email.subject, "[MOCK] Email would be sent");
        DeliveryResult::delivered(Some(format!("mock-email-{}", count)))
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

// =============================================================================
// Rendering
// =============================================================================

/// Renders through an HTTP document service: POSTs the invoice document as
/// JSON and expects PDF bytes back.
pub struct HttpDocumentRenderer {
    client: reqwest::Client,
    url: String,
}

impl HttpDocumentRenderer {
    pub fn new(config: &RendererConfig) -> Result<Self, BillingError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                BillingError::Configuration(format!("Failed to build renderer client: {}", e))
            })?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl DocumentRenderer for HttpDocumentRenderer {
    #[instrument(skip(self, document), fields(invoice_id = %document.invoice_id))]
    async fn render(&self, document: &InvoiceDocument) -> Result<Vec<u8>, BillingError> {
        let mut headers = reqwest::header::HeaderMap::new();
        inject_trace_context(&mut headers);

        let response = self
            .client
            .post(&self.url)
            .headers(headers)
            .json(document)
            .send()
            .await
            .map_err(|e| BillingError::DeliveryFailure(format!("Renderer unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(BillingError::DeliveryFailure(format!(
                "Renderer returned {}",
                response.status()
            )));
        }

        let bytes = response.bytes().await.map_err(|e| {
            BillingError::DeliveryFailure(format!("Failed to read rendered document: {}", e))
        })?;
        Ok(bytes.to_vec())
    }
}

/// Renderer that returns fixed bytes.
pub struct StaticDocumentRenderer {
    bytes: Vec<u8>,
}

impl StaticDocumentRenderer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

#[async_trait]
impl DocumentRenderer for StaticDocumentRenderer {
    async fn render(&self, _document: &InvoiceDocument) -> Result<Vec<u8>, BillingError> {
        Ok(self.bytes.clone())
    }
}

// =============================================================================
// Invoice mailer
// =============================================================================

/// Composes and sends the invoice email. Without a renderer the email goes
/// out without a PDF.
#[derive(Clone)]
pub struct InvoiceMailer {
    sender: Arc<dyn EmailSender>,
    renderer: Option<Arc<dyn DocumentRenderer>>,
}

impl InvoiceMailer {
    pub fn new(sender: Arc<dyn EmailSender>, renderer: Option<Arc<dyn DocumentRenderer>>) -> Self {
        Self { sender, renderer }
    }

    #[instrument(skip(self, invoice, lines), fields(invoice_id = %invoice.invoice_id))]
    pub async fn deliver(&self, invoice: &Invoice, lines: &[InvoiceLineItem]) -> DeliveryResult {
        if invoice.customer_emails.is_empty() {
            return DeliveryResult::failed("invoice has no recipient address");
        }

        let document = InvoiceDocument::new(invoice, lines);
        let attachment = match &self.renderer {
            Some(renderer) => match renderer.render(&document).await {
                Ok(bytes) => Some(EmailAttachment {
                    filename: format!("{}.pdf", invoice.billing_number),
                    content_type: "application/pdf".to_string(),
                    bytes,
                }),
                Err(e) => {
                    warn!(error = %e, "Invoice document rendering failed");
                    return DeliveryResult::failed(e.to_string());
                }
            },
            None => None,
        };

        let email = compose(invoice, attachment);
        self.sender.send(&email).await
    }
}

fn compose(invoice: &Invoice, attachment: Option<EmailAttachment>) -> OutgoingEmail {
    let subject = format!("Invoice {}", invoice.billing_number);
    let body_text = format!(
        "Dear {},\n\nPlease find invoice {} dated {}.\nAmount due: {} on or before {}.\n",
        invoice.customer_name,
        invoice.billing_number,
        invoice.statement_date,
        invoice.net_amount,
        invoice.due_date
    );
    let body_html = format!(
        "<p>Dear {},</p><p>Please find invoice <strong>{}</strong> dated {}.</p>\
         <p>Amount due: <strong>{}</strong> on or before {}.</p>",
        invoice.customer_name,
        invoice.billing_number,
        invoice.statement_date,
        invoice.net_amount,
        invoice.due_date
    );
    OutgoingEmail {
        to: invoice.customer_emails.clone(),
        subject,
        body_text,
        body_html,
        attachment,
    }
}
