use crate::common::{Config, FaceAuthError, Result};
use crate::pipeline::source::{yuyv_to_grayscale, Capture, FrameSource};
use std::time::{Duration, SystemTime};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture as _;
use v4l::{Device, FourCC};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PixelFormat {
    Grey,
    Yuyv,
}

pub struct Camera {
    device: Device,
    index: u32,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    warmup_frames: u32,
    warmup_delay: Duration,
}

pub struct CameraSession<'a> {
    camera: &'a Camera,
    stream: v4l::io::mmap::Stream<'a>,
}

impl Camera {
    pub fn new(config: &Config) -> Result<Self> {
        let index = config.camera.device_index;
        let device = Device::new(index as usize)
            .map_err(|e| FaceAuthError::Camera(format!("Failed to open camera {}: {}", index, e)))?;

        let caps = device.query_caps()
            .map_err(|e| FaceAuthError::Camera(format!("Failed to query capabilities: {}", e)))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            // Some IR devices report only metadata capture but still stream.
            tracing::warn!("Device {} ({}) may not support standard video capture", index, caps.card);
        }

        let mut fmt = device.format()
            .map_err(|e| FaceAuthError::Camera(format!("Failed to get format: {}", e)))?;
        fmt.width = config.camera.width;
        fmt.height = config.camera.height;
        // IR cameras negotiate GREY on their own; ask for YUYV otherwise.
        if fmt.fourcc != FourCC::new(b"GREY") {
            fmt.fourcc = FourCC::new(b"YUYV");
        }

        if let Err(e) = device.set_format(&fmt) {
            tracing::warn!("Could not set exact format: {}. Using device defaults.", e);
        }

        let negotiated = device.format()
            .map_err(|e| FaceAuthError::Camera(format!("Failed to get final format: {}", e)))?;
        let pixel_format = if negotiated.fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if negotiated.fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else {
            return Err(FaceAuthError::Camera(format!(
                "unsupported pixel format {:?} (need GREY or YUYV)", negotiated.fourcc
            )));
        };

        tracing::info!(
            device = index,
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "Camera opened"
        );
        if negotiated.width != config.camera.width || negotiated.height != config.camera.height {
            tracing::warn!(
                "Camera resolution {}x{} differs from requested {}x{}",
                negotiated.width, negotiated.height, config.camera.width, config.camera.height
            );
        }

        Ok(Self {
            device,
            index,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
            warmup_frames: config.camera.warmup_frames,
            warmup_delay: Duration::from_millis(config.camera.warmup_delay_ms),
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Opens a capture stream and discards the warmup frames the IR emitter needs.
    pub fn start_session(&self) -> Result<CameraSession<'_>> {
        let mut stream = v4l::io::mmap::Stream::with_buffers(&self.device, Type::VideoCapture, 8)
            .map_err(|e| FaceAuthError::Camera(format!("Failed to create stream: {}", e)))?;

        for i in 0..self.warmup_frames {
            stream.next()
                .map_err(|e| FaceAuthError::Camera(format!("Failed to capture warmup frame {}: {}", i, e)))?;
            std::thread::sleep(self.warmup_delay);
        }
        tracing::debug!("Camera {} warmed up after {} frames", self.index, self.warmup_frames);

        Ok(CameraSession { camera: self, stream })
    }

    fn to_gray(&self, buf: &[u8]) -> Result<Vec<u8>> {
        let pixels = self.width as usize * self.height as usize;
        match self.pixel_format {
            PixelFormat::Grey => {
                if buf.len() < pixels {
                    return Err(FaceAuthError::Camera(format!(
                        "GREY buffer too short: expected {}, got {}", pixels, buf.len()
                    )));
                }
                Ok(buf[..pixels].to_vec())
            }
            PixelFormat::Yuyv => yuyv_to_grayscale(buf, self.width, self.height),
        }
    }
}

impl<'a> FrameSource for CameraSession<'a> {
    fn next_capture(&mut self) -> Result<Option<Capture>> {
        let (buf, _meta) = self.stream.next()
            .map_err(|e| FaceAuthError::Camera(format!("Failed to capture: {}", e)))?;
        let timestamp = SystemTime::now();
        let data = self.camera.to_gray(buf)?;

        Ok(Some(Capture {
            data,
            width: self.camera.width,
            height: self.camera.height,
            timestamp,
        }))
    }
}
