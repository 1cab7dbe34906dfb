//! Executes a decoded [`UrbRequest`] against an open device handle and
//! produces the matching [`UrbCompletion`].

use std::time::Duration;

use protocol::status::StatusCode;
use protocol::types::{Direction, TransferType, UrbCompletion, UrbRequest};
use rusb::{Context, DeviceHandle};
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn execute_urb(handle: &mut DeviceHandle<Context>, request: &UrbRequest) -> UrbCompletion {
    let result = match request.transfer_type {
        TransferType::Control => execute_control(handle, request),
        TransferType::Bulk => execute_bulk(handle, request),
        TransferType::Interrupt => execute_interrupt(handle, request),
        TransferType::Isochronous => Err(StatusCode::NotSupported),
    };

    match result {
        Ok(data) => UrbCompletion {
            device: request.device,
            urb_id: request.urb_id,
            status: StatusCode::Success,
            actual_length: data.as_ref().map(|d| d.len() as u32).unwrap_or(0),
            data_in: data,
        },
        Err(status) => UrbCompletion {
            device: request.device,
            urb_id: request.urb_id,
            status,
            actual_length: 0,
            data_in: None,
        },
    }
}

fn execute_control(
    handle: &mut DeviceHandle<Context>,
    request: &UrbRequest,
) -> Result<Option<Vec<u8>>, StatusCode> {
    let setup = &request.setup;
    match request.direction {
        Direction::In => {
            let mut buffer = vec![0u8; request.buf_len as usize];
            match handle.read_control(
                setup.bm_request_type,
                setup.b_request,
                setup.w_value,
                setup.w_index,
                &mut buffer,
                DEFAULT_TIMEOUT,
            ) {
                Ok(len) => {
                    buffer.truncate(len);
                    Ok(Some(buffer))
                }
                Err(e) => Err(map_rusb_error(e)),
            }
        }
        Direction::Out => {
            let data = request.data_out.as_deref().unwrap_or(&[]);
            match handle.write_control(
                setup.bm_request_type,
                setup.b_request,
                setup.w_value,
                setup.w_index,
                data,
                DEFAULT_TIMEOUT,
            ) {
                Ok(_) => Ok(None),
                Err(e) => Err(map_rusb_error(e)),
            }
        }
    }
}

fn execute_bulk(
    handle: &mut DeviceHandle<Context>,
    request: &UrbRequest,
) -> Result<Option<Vec<u8>>, StatusCode> {
    match request.direction {
        Direction::In => {
            let mut buffer = vec![0u8; request.buf_len as usize];
            let timeout = Duration::from_millis(100);
            match handle.read_bulk(request.endpoint, &mut buffer, timeout) {
                Ok(len) => {
                    buffer.truncate(len);
                    Ok(Some(buffer))
                }
                Err(rusb::Error::Timeout) | Err(rusb::Error::Io) => {
                    debug!(
                        "bulk IN timeout/io on endpoint {:#x}, no data available",
                        request.endpoint
                    );
                    Ok(Some(Vec::new()))
                }
                Err(e) => Err(map_rusb_error(e)),
            }
        }
        Direction::Out => {
            let data = request.data_out.as_deref().unwrap_or(&[]);
            let timeout = Duration::from_millis(DEFAULT_TIMEOUT.as_millis() as u64);
            match handle.write_bulk(request.endpoint, data, timeout) {
                Ok(_) => Ok(None),
                Err(e) => Err(map_rusb_error(e)),
            }
        }
    }
}

fn execute_interrupt(
    handle: &mut DeviceHandle<Context>,
    request: &UrbRequest,
) -> Result<Option<Vec<u8>>, StatusCode> {
    match request.direction {
        Direction::In => {
            let mut buffer = vec![0u8; request.buf_len as usize];
            let timeout = Duration::from_millis(100);
            match handle.read_interrupt(request.endpoint, &mut buffer, timeout) {
                Ok(len) => {
                    buffer.truncate(len);
                    Ok(Some(buffer))
                }
                Err(rusb::Error::Timeout) | Err(rusb::Error::Io) => Ok(Some(Vec::new())),
                Err(e) => Err(map_rusb_error(e)),
            }
        }
        Direction::Out => {
            let data = request.data_out.as_deref().unwrap_or(&[]);
            let timeout = Duration::from_millis(DEFAULT_TIMEOUT.as_millis() as u64);
            match handle.write_interrupt(request.endpoint, data, timeout) {
                Ok(_) => Ok(None),
                Err(e) => Err(map_rusb_error(e)),
            }
        }
    }
}

fn map_rusb_error(err: rusb::Error) -> StatusCode {
    match err {
        rusb::Error::Timeout => StatusCode::Timeout,
        rusb::Error::Pipe => StatusCode::Stall,
        rusb::Error::NoDevice => StatusCode::NoDevice,
        rusb::Error::NotFound => StatusCode::NoDevice,
        rusb::Error::InvalidParam => StatusCode::InvalidParam,
        rusb::Error::NoMem => StatusCode::NoMemory,
        _ => {
            warn!("unmapped rusb error treated as generic Error: {err}");
            StatusCode::Error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), StatusCode::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), StatusCode::Stall);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), StatusCode::NoDevice);
    }
}
