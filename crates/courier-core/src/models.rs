//! Core domain models and strongly-typed identifiers.
//!
//! Defines webhook subscriptions, delivery records, and newtype ID wrappers
//! for compile-time type safety. Includes database serialization traits and
//! the delivery record state machine:
//!
//! ```text
//! Pending -> Processing -> Successful
//!                       -> Failed -> Processing (retry, while attempts remain)
//! ```

use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    std::result::Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Default HTTP timeout applied to new subscriptions.
pub const DEFAULT_TIMEOUT_SECONDS: u32 = 30;

/// Default number of attempts a delivery may use before it is exhausted.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Strongly-typed subscription identifier.
///
/// Sent to receivers in the `X-Webhook-Id` header and used as the foreign key
/// on every delivery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub Uuid);

impl SubscriptionId {
    /// Creates a new random subscription ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for SubscriptionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for SubscriptionId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for SubscriptionId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for SubscriptionId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed delivery identifier.
///
/// This is the only handle that crosses the task queue; workers reload the
/// record and its subscription from storage for every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    /// Creates a new random delivery ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DeliveryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for DeliveryId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryId {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Shared HMAC secret of a subscription.
///
/// Treated as an opaque byte string. `Debug` never prints the material so a
/// subscription can be logged safely.
#[derive(Clone, PartialEq, Eq)]
pub struct SigningSecret(Vec<u8>);

impl SigningSecret {
    /// Wraps raw secret bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw key material used as the HMAC key.
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Returns true if the secret holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SigningSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningSecret(***)")
    }
}

impl From<&str> for SigningSecret {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for SigningSecret {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl sqlx::Type<PgDb> for SigningSecret {
    fn type_info() -> PgTypeInfo {
        <Vec<u8> as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for SigningSecret {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let bytes = <Vec<u8> as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(bytes))
    }
}

impl sqlx::Encode<'_, PgDb> for SigningSecret {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Vec<u8> as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Owner-driven lifecycle of a subscription.
///
/// Only `Active` subscriptions receive deliveries. Pausing or disabling does
/// not interrupt an attempt that already passed the dispatcher's guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Receiving deliveries.
    Active,
    /// Temporarily suspended by its owner.
    Paused,
    /// Switched off.
    Disabled,
}

impl SubscriptionStatus {
    /// Database representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<PgDb> for SubscriptionStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for SubscriptionStatus {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "disabled" => Ok(Self::Disabled),
            _ => Err(format!("invalid subscription status: {s}").into()),
        }
    }
}

/// Delivery record lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created, no attempt started yet.
    Pending,

    /// An attempt is in flight.
    Processing,

    /// Receiver answered 2xx. Terminal.
    Successful,

    /// Last attempt failed. Terminal once attempts are exhausted.
    Failed,
}

impl DeliveryStatus {
    /// Database representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Successful => "successful",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> std::result::Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "successful" => Ok(Self::Successful),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid delivery status: {s}").into()),
        }
    }
}

/// Subscription counter touched after every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterField {
    /// Successful deliveries.
    Success,
    /// Failed attempts.
    Failure,
}

impl CounterField {
    /// Column holding this counter.
    pub const fn column(self) -> &'static str {
        match self {
            Self::Success => "success_count",
            Self::Failure => "failure_count",
        }
    }
}

/// A registered webhook target.
///
/// Owns its current and previous signing secret. The previous secret only
/// exists while a rotation grace period is running; the rotation manager
/// is the only component expected to touch the secret fields.
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Unique identifier.
    pub id: SubscriptionId,

    /// Human-readable name, included in every outbound payload.
    pub name: String,

    /// Destination URL for deliveries.
    pub url: String,

    /// Secret used to sign every outbound delivery.
    pub secret: SigningSecret,

    /// Secret replaced by the last rotation, accepted for inbound
    /// verification until `previous_secret_expires_at`.
    pub previous_secret: Option<SigningSecret>,

    /// When the secret was last rotated.
    pub secret_rotated_at: Option<DateTime<Utc>>,

    /// End of the grace period for `previous_secret`.
    pub previous_secret_expires_at: Option<DateTime<Utc>>,

    /// Event types this subscription receives. Exact string match.
    pub event_types: Vec<String>,

    /// Owner-controlled lifecycle status.
    pub status: SubscriptionStatus,

    /// HTTP timeout for a single attempt.
    pub timeout_seconds: u32,

    /// Total attempts a delivery may use.
    pub max_retries: u32,

    /// Deliveries that ended with a 2xx.
    pub success_count: u64,

    /// Attempts that failed.
    pub failure_count: u64,

    /// When an attempt last completed for this subscription.
    pub last_triggered_at: Option<DateTime<Utc>>,

    /// When this subscription was created.
    pub created_at: DateTime<Utc>,

    /// When configuration was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Creates an active subscription with default timeout and retry limits.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        secret: SigningSecret,
        event_types: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SubscriptionId::new(),
            name: name.into(),
            url: url.into(),
            secret,
            previous_secret: None,
            secret_rotated_at: None,
            previous_secret_expires_at: None,
            event_types,
            status: SubscriptionStatus::Active,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_retries: DEFAULT_MAX_RETRIES,
            success_count: 0,
            failure_count: 0,
            last_triggered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overrides the attempt limit.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Overrides the per-attempt HTTP timeout.
    #[must_use]
    pub fn with_timeout_seconds(mut self, timeout_seconds: u32) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// Overrides the lifecycle status.
    #[must_use]
    pub fn with_status(mut self, status: SubscriptionStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether deliveries may start for this subscription.
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Whether this subscription listens for `event_type`.
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.event_types.iter().any(|subscribed| subscribed == event_type)
    }

    /// Per-attempt HTTP timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_seconds))
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Subscription {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        use sqlx::Row;

        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            url: row.try_get("url")?,
            secret: row.try_get("secret")?,
            previous_secret: row.try_get("previous_secret")?,
            secret_rotated_at: row.try_get("secret_rotated_at")?,
            previous_secret_expires_at: row.try_get("previous_secret_expires_at")?,
            event_types: row.try_get("event_types")?,
            status: row.try_get("status")?,
            timeout_seconds: non_negative_u32(row, "timeout_seconds")?,
            max_retries: non_negative_u32(row, "max_retries")?,
            success_count: non_negative_u64(row, "success_count")?,
            failure_count: non_negative_u64(row, "failure_count")?,
            last_triggered_at: row.try_get("last_triggered_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// One tracked notification of a subscription about one event occurrence.
///
/// Fields are private so the state machine can only be driven through the
/// transition methods: the attempt counter never decreases, `Successful`
/// is terminal, and the stored payload is never modified after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryRecord {
    id: DeliveryId,
    subscription_id: SubscriptionId,
    event_type: String,
    payload: serde_json::Value,
    status: DeliveryStatus,
    attempts: u32,
    response_code: Option<u16>,
    response_body: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl DeliveryRecord {
    /// Creates a `Pending` record for an event occurrence.
    pub fn new(
        subscription_id: SubscriptionId,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            subscription_id,
            event_type: event_type.into(),
            payload,
            status: DeliveryStatus::Pending,
            attempts: 0,
            response_code: None,
            response_body: None,
            created_at: now,
            completed_at: None,
        }
    }

    /// Unique identifier.
    pub fn id(&self) -> DeliveryId {
        self.id
    }

    /// Owning subscription.
    pub fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// Event type string, e.g. `user.created`.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Event body as stored at creation, before metadata is merged in.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Current status.
    pub fn status(&self) -> DeliveryStatus {
        self.status
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// HTTP status of the last response, if the receiver answered.
    pub fn response_code(&self) -> Option<u16> {
        self.response_code
    }

    /// Response body or transport error text of the last attempt.
    pub fn response_body(&self) -> Option<&str> {
        self.response_body.as_deref()
    }

    /// When the record was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the last attempt finished.
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Whether another attempt may start under `max_retries`.
    pub fn can_attempt(&self, max_retries: u32) -> bool {
        match self.status {
            DeliveryStatus::Pending => true,
            DeliveryStatus::Failed => self.attempts < max_retries,
            DeliveryStatus::Processing | DeliveryStatus::Successful => false,
        }
    }

    /// Whether no further attempt can ever start.
    pub fn is_terminal(&self, max_retries: u32) -> bool {
        match self.status {
            DeliveryStatus::Successful => true,
            DeliveryStatus::Failed => self.attempts >= max_retries,
            DeliveryStatus::Pending | DeliveryStatus::Processing => false,
        }
    }

    /// Moves `Pending` or retryable `Failed` to `Processing` and counts the
    /// attempt. Returns the 1-based number of the attempt just started.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` if the record is in flight,
    /// successful, or failed with no attempts left.
    pub fn begin_attempt(&mut self, max_retries: u32) -> Result<u32> {
        if !self.can_attempt(max_retries) {
            return Err(CoreError::InvalidTransition {
                from: self.status,
                to: DeliveryStatus::Processing,
            });
        }

        self.status = DeliveryStatus::Processing;
        self.attempts = self.attempts.saturating_add(1);
        self.completed_at = None;
        Ok(self.attempts)
    }

    /// Records a 2xx response and moves `Processing` to `Successful`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the record is
    /// `Processing`.
    pub fn mark_successful(
        &mut self,
        response_code: u16,
        response_body: String,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.complete(DeliveryStatus::Successful, Some(response_code), response_body, now)
    }

    /// Records a non-2xx response or transport error and moves `Processing`
    /// to `Failed`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidTransition` unless the record is
    /// `Processing`.
    pub fn mark_failed(
        &mut self,
        response_code: Option<u16>,
        error: String,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.complete(DeliveryStatus::Failed, response_code, error, now)
    }

    fn complete(
        &mut self,
        to: DeliveryStatus,
        response_code: Option<u16>,
        response_body: String,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status != DeliveryStatus::Processing {
            return Err(CoreError::InvalidTransition { from: self.status, to });
        }

        self.status = to;
        self.response_code = response_code;
        self.response_body = Some(response_body);
        self.completed_at = Some(now);
        Ok(())
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeliveryRecord {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        use sqlx::Row;

        let payload: sqlx::types::Json<serde_json::Value> = row.try_get("payload")?;
        let response_code: Option<i32> = row.try_get("response_code")?;

        Ok(Self {
            id: row.try_get("id")?,
            subscription_id: row.try_get("subscription_id")?,
            event_type: row.try_get("event_type")?,
            payload: payload.0,
            status: row.try_get("status")?,
            attempts: non_negative_u32(row, "attempts")?,
            response_code: response_code
                .map(u16::try_from)
                .transpose()
                .map_err(|_| sqlx::Error::Decode("response_code out of range".into()))?,
            response_body: row.try_get("response_body")?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

fn non_negative_u32(row: &PgRow, column: &str) -> std::result::Result<u32, sqlx::Error> {
    use sqlx::Row;

    let value: i32 = row.try_get(column)?;
    u32::try_from(value)
        .map_err(|_| sqlx::Error::Decode(format!("{column} cannot be negative").into()))
}

fn non_negative_u64(row: &PgRow, column: &str) -> std::result::Result<u64, sqlx::Error> {
    use sqlx::Row;

    let value: i64 = row.try_get(column)?;
    u64::try_from(value)
        .map_err(|_| sqlx::Error::Decode(format!("{column} cannot be negative").into()))
}
