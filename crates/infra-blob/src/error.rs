// object_store::Error -> IntegrationDataStoreError
//
// Storage backends report failures as typed variants rather than HTTP
// responses; each variant is given the status an HTTP backend would return,
// which is what retry classification keys on.

use bulkimport_core::port::integration_store::status;
use bulkimport_core::port::IntegrationDataStoreError;

pub fn map_store_error(err: object_store::Error) -> IntegrationDataStoreError {
    let status_code = match &err {
        object_store::Error::NotFound { .. } => status::NOT_FOUND,
        object_store::Error::AlreadyExists { .. } => status::CONFLICT,
        object_store::Error::Precondition { .. } | object_store::Error::NotModified { .. } => {
            status::PRECONDITION_FAILED
        }
        object_store::Error::PermissionDenied { .. } => status::FORBIDDEN,
        object_store::Error::Unauthenticated { .. } => status::UNAUTHORIZED,
        object_store::Error::InvalidPath { .. }
        | object_store::Error::UnknownConfigurationKey { .. } => status::BAD_REQUEST,
        object_store::Error::NotSupported { .. } | object_store::Error::NotImplemented => {
            status::NOT_IMPLEMENTED
        }
        _ => status::INTERNAL_SERVER_ERROR,
    };
    IntegrationDataStoreError::new(err.to_string(), status_code)
}
