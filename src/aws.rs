//! AWS-related code shared by different modules.

use aws_config::BehaviorVersion;
use aws_smithy_runtime_api::client::{orchestrator::HttpResponse, result::SdkError};
use reqwest::StatusCode;

use crate::{prelude::*, retry::IsKnownTransient};

/// Load the user's AWS configuration using standard conventions.
pub async fn load_aws_config() -> Result<aws_config::SdkConfig> {
    Ok(aws_config::load_defaults(BehaviorVersion::v2025_01_17()).await)
}

impl<E: IsKnownTransient> IsKnownTransient for SdkError<E, HttpResponse> {
    fn is_known_transient(&self) -> bool {
        match self {
            // We never got a usable response, so trying again may help.
            SdkError::TimeoutError(_)
            | SdkError::DispatchFailure(_)
            | SdkError::ResponseError(_) => true,
            SdkError::ServiceError(err) => {
                err.err().is_known_transient()
                    || StatusCode::from_u16(err.raw().status().as_u16())
                        .is_ok_and(|status| status.is_known_transient())
            }
            _ => false,
        }
    }
}
