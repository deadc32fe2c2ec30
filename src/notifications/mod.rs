//! Best-effort customer notifications.
//!
//! Every send happens on a spawned task after the order is committed. Failures
//! are logged and counted; they never reach the checkout or payment caller.

use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::AppConfig;
use crate::entities::{order, order_line};

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Email delivery failed: {0}")]
    Email(String),
    #[error("SMS gateway rejected message with status {0}")]
    SmsRejected(u16),
    #[error("SMS transport error: {0}")]
    Http(#[from] reqwest::Error),
}

/// A rendered order email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_order_email(&self, email: &OrderEmail) -> Result<(), NotificationError>;
}

#[async_trait]
pub trait SmsGateway: Send + Sync {
    async fn send_sms(&self, phone: &str, message: &str) -> Result<(), NotificationError>;
}

/// Writes emails to the log instead of an SMTP relay.
#[derive(Debug, Default, Clone)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_order_email(&self, email: &OrderEmail) -> Result<(), NotificationError> {
        info!(to = %email.to, subject = %email.subject, "Order email queued");
        debug!(body = %email.body, "Order email body");
        Ok(())
    }
}

/// Used when no SMS credentials are configured.
#[derive(Debug, Default, Clone)]
pub struct DisabledSmsGateway;

#[async_trait]
impl SmsGateway for DisabledSmsGateway {
    async fn send_sms(&self, phone: &str, _message: &str) -> Result<(), NotificationError> {
        debug!(phone = %phone, "SMS disabled; skipping message");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct HubtelMessage<'a> {
    from: &'a str,
    to: &'a str,
    content: &'a str,
}

/// Hubtel quick-send over HTTPS.
#[derive(Clone)]
pub struct HubtelSmsGateway {
    client: reqwest::Client,
    endpoint: String,
    client_id: String,
    api_key: String,
    sender: String,
}

impl HubtelSmsGateway {
    pub fn new(
        endpoint: impl Into<String>,
        client_id: impl Into<String>,
        api_key: impl Into<String>,
        sender: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            client_id: client_id.into(),
            api_key: api_key.into(),
            sender: sender.into(),
        })
    }
}

#[async_trait]
impl SmsGateway for HubtelSmsGateway {
    #[instrument(skip(self, message))]
    async fn send_sms(&self, phone: &str, message: &str) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.client_id, Some(&self.api_key))
            .json(&HubtelMessage {
                from: &self.sender,
                to: phone,
                content: message,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotificationError::SmsRejected(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Builds the SMS gateway the configuration asks for.
pub fn sms_gateway_from_config(cfg: &AppConfig) -> Result<Arc<dyn SmsGateway>, NotificationError> {
    match cfg.sms_credentials() {
        Some((api_key, client_id)) => Ok(Arc::new(HubtelSmsGateway::new(
            cfg.sms_endpoint.clone(),
            client_id,
            api_key,
            cfg.sms_sender.clone(),
            Duration::from_secs(cfg.sms_timeout_secs),
        )?)),
        None => {
            info!("SMS credentials not configured; SMS notifications disabled");
            Ok(Arc::new(DisabledSmsGateway))
        }
    }
}

/// Fans order confirmations out to email and SMS.
#[derive(Clone)]
pub struct NotificationDispatcher {
    mailer: Arc<dyn Mailer>,
    sms: Arc<dyn SmsGateway>,
    store_name: String,
    currency_symbol: String,
    from_email: String,
}

impl NotificationDispatcher {
    pub fn new(
        mailer: Arc<dyn Mailer>,
        sms: Arc<dyn SmsGateway>,
        store_name: impl Into<String>,
        currency_symbol: impl Into<String>,
        from_email: impl Into<String>,
    ) -> Self {
        Self {
            mailer,
            sms,
            store_name: store_name.into(),
            currency_symbol: currency_symbol.into(),
            from_email: from_email.into(),
        }
    }

    pub fn from_config(
        cfg: &AppConfig,
        mailer: Arc<dyn Mailer>,
        sms: Arc<dyn SmsGateway>,
    ) -> Self {
        Self::new(
            mailer,
            sms,
            cfg.store_name.clone(),
            cfg.currency_symbol.clone(),
            cfg.notification_from_email.clone(),
        )
    }

    /// Confirms a cash-on-delivery order.
    pub fn order_placed_cod(
        &self,
        order: &order::Model,
        lines: &[order_line::Model],
    ) -> JoinHandle<()> {
        let email = self.render_email("Order Placed (COD)", order, lines);
        let sms = format!(
            "{}: Order {} placed. Pay on delivery. Total {} {}.",
            self.store_name,
            order.order_number,
            self.currency_symbol,
            order.total()
        );
        self.dispatch(order.order_number.clone(), order.phone.clone(), email, sms)
    }

    /// Confirms a completed mobile-money payment.
    pub fn order_paid(&self, order: &order::Model, lines: &[order_line::Model]) -> JoinHandle<()> {
        let email = self.render_email("Order Paid", order, lines);
        let sms = format!(
            "{}: Payment received for order {}. Thank you!",
            self.store_name, order.order_number
        );
        self.dispatch(order.order_number.clone(), order.phone.clone(), email, sms)
    }

    fn render_email(
        &self,
        subject_prefix: &str,
        order: &order::Model,
        lines: &[order_line::Model],
    ) -> OrderEmail {
        let mut body = format!(
            "Hello {},\n\nThank you for your order {}.\n\n",
            order.full_name, order.order_number
        );
        for line in lines {
            body.push_str(&format!(
                "{} x {} @ {} {} = {} {}\n",
                line.quantity,
                line.title_snapshot,
                self.currency_symbol,
                line.unit_price(),
                self.currency_symbol,
                line.line_total()
            ));
        }
        body.push_str(&format!(
            "\nSubtotal: {sym} {}\nShipping: {sym} {}\nTotal: {sym} {}\n\n{}\n",
            order.subtotal(),
            order.shipping_fee(),
            order.total(),
            self.store_name,
            sym = self.currency_symbol
        ));

        OrderEmail {
            from: self.from_email.clone(),
            to: order.email.clone(),
            subject: format!(
                "{} #{} - {}",
                subject_prefix, order.order_number, self.store_name
            ),
            body,
        }
    }

    fn dispatch(
        &self,
        order_number: String,
        phone: String,
        email: OrderEmail,
        sms: String,
    ) -> JoinHandle<()> {
        let mailer = self.mailer.clone();
        let gateway = self.sms.clone();

        // The two channels are independent; one failing never blocks the other.
        tokio::spawn(async move {
            let (email_result, sms_result) = futures::join!(
                mailer.send_order_email(&email),
                gateway.send_sms(&phone, &sms)
            );
            if let Err(e) = email_result {
                warn!(order_number = %order_number, error = %e, "Order email failed");
                counter!("bookshop_notifications.failed", 1, "channel" => "email");
            }
            if let Err(e) = sms_result {
                warn!(order_number = %order_number, error = %e, "Order SMS failed");
                counter!("bookshop_notifications.failed", 1, "channel" => "sms");
            }
        })
    }
}
