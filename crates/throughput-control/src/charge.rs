/// Capability of carrying the cost the backend billed for a request.
///
/// Implemented by executor responses and by executor errors that still reached
/// the backend. `None` means the outcome is free.
pub trait RequestCharge {
    fn request_charge(&self) -> Option<f64>;
}

impl RequestCharge for () {
    fn request_charge(&self) -> Option<f64> {
        None
    }
}

impl<T: RequestCharge + ?Sized> RequestCharge for Box<T> {
    fn request_charge(&self) -> Option<f64> {
        (**self).request_charge()
    }
}

/// A value paired with the charge billed for producing it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargedResponse<T> {
    pub value: T,
    pub request_charge: Option<f64>,
}

impl<T> ChargedResponse<T> {
    pub fn new(value: T, request_charge: f64) -> Self {
        Self {
            value,
            request_charge: Some(request_charge),
        }
    }

    pub fn uncharged(value: T) -> Self {
        Self {
            value,
            request_charge: None,
        }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> RequestCharge for ChargedResponse<T> {
    fn request_charge(&self) -> Option<f64> {
        self.request_charge
    }
}

/// Per-request metadata consumed by the throttler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestDescriptor {
    /// Label used in logs only.
    pub operation: String,
    /// Cost reserved at admission and trued up against the billed charge.
    pub estimated_charge: f64,
}

impl RequestDescriptor {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            estimated_charge: 0.0,
        }
    }

    pub fn with_estimated_charge(mut self, estimated_charge: f64) -> Self {
        self.estimated_charge = estimated_charge;
        self
    }

    /// Amount to reserve at admission. Non-finite or negative estimates reserve nothing.
    pub(crate) fn reservation(&self) -> f64 {
        sanitize_charge(self.estimated_charge).unwrap_or(0.0)
    }
}

/// Per-request routing options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Explicit group; `None` routes to the default group.
    pub throughput_control_group_name: Option<String>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_throughput_control_group(mut self, group_name: impl Into<String>) -> Self {
        self.throughput_control_group_name = Some(group_name.into());
        self
    }
}

/// Drops charges that would corrupt the budget.
pub(crate) fn sanitize_charge(charge: f64) -> Option<f64> {
    (charge.is_finite() && charge > 0.0).then_some(charge)
}
