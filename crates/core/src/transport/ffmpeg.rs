use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::device::MediaSource;
use crate::error::{Result, StreamError};
use crate::session::params::{AudioCodec, AudioParams, StartRequest, VideoParams};

use super::{EncoderProcess, MediaTransport, OutboundFlow, TransportContext, TransportHandle};

/// SRTP suite negotiated with every controller.
pub const SRTP_SUITE: &str = "AES_CM_128_HMAC_SHA1_80";

/// How the device's elementary streams are turned into the outbound flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Re-encode to the codec parameters of the START request.
    Transcode,
    /// Copy the device's streams untouched; only the framing changes.
    Passthrough,
}

impl Default for TransportMode {
    fn default() -> Self {
        if cfg!(feature = "passthrough") {
            Self::Passthrough
        } else {
            Self::Transcode
        }
    }
}

#[derive(Debug, Clone)]
pub struct FfmpegConfig {
    /// Path to the ffmpeg binary.
    pub binary: PathBuf,
    pub mode: TransportMode,
    /// Extra arguments placed before the device's own input arguments.
    pub input_args: Vec<String>,
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
            mode: TransportMode::default(),
            input_args: Vec::new(),
        }
    }
}

/// Transport starter that runs one ffmpeg process per session, reading the
/// device stream and emitting SRTP video and audio to the controller.
#[derive(Debug, Clone, Default)]
pub struct FfmpegTransport {
    config: FfmpegConfig,
}

impl FfmpegTransport {
    pub fn new(config: FfmpegConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FfmpegConfig {
        &self.config
    }

    /// Full ffmpeg argument list for one session.
    pub fn command_args(
        &self,
        source: &MediaSource,
        controller: IpAddr,
        video: &OutboundFlow,
        audio: &OutboundFlow,
        start: &StartRequest,
    ) -> Vec<String> {
        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error"]
            .into_iter()
            .map(String::from)
            .collect();

        args.extend(self.config.input_args.iter().cloned());
        args.extend(source.input_args.iter().cloned());
        args.push("-i".into());
        args.push(source.url.clone());

        args.extend(["-an", "-sn", "-dn"].map(String::from));
        self.video_codec_args(&start.video, &mut args);
        push_srtp_output(&mut args, controller, video, start.video.payload_type, Some(start.video.mtu));

        args.extend(["-vn", "-sn", "-dn"].map(String::from));
        self.audio_codec_args(&start.audio, &mut args);
        push_srtp_output(&mut args, controller, audio, start.audio.payload_type, None);

        args
    }

    fn video_codec_args(&self, video: &VideoParams, args: &mut Vec<String>) {
        if self.config.mode == TransportMode::Passthrough {
            args.extend(["-vcodec", "copy"].map(String::from));
            return;
        }

        args.extend(
            [
                "-vcodec",
                "libx264",
                "-pix_fmt",
                "yuvj420p",
                "-preset",
                "ultrafast",
                "-tune",
                "zerolatency",
                "-profile:v",
                video.profile.as_str(),
                "-level:v",
                video.level.as_str(),
            ]
            .map(String::from),
        );
        args.push("-b:v".into());
        args.push(format!("{}k", video.max_bitrate));
        args.push("-maxrate".into());
        args.push(format!("{}k", video.max_bitrate));
        args.push("-bufsize".into());
        args.push(format!("{}k", video.max_bitrate.saturating_mul(2)));
        args.push("-r".into());
        args.push(video.fps.to_string());
        args.push("-vf".into());
        args.push(format!("scale={}:{}", video.width, video.height));
    }

    fn audio_codec_args(&self, audio: &AudioParams, args: &mut Vec<String>) {
        if self.config.mode == TransportMode::Passthrough {
            args.extend(["-acodec", "copy"].map(String::from));
            return;
        }

        match audio.codec {
            AudioCodec::Opus => {
                args.extend(["-acodec", "libopus", "-application", "lowdelay"].map(String::from));
                args.push("-frame_duration".into());
                args.push(audio.packet_time.to_string());
            }
            AudioCodec::AacEld => {
                args.extend(["-acodec", "libfdk_aac", "-profile:a", "aac_eld"].map(String::from));
            }
        }
        args.extend(["-flags", "+global_header"].map(String::from));
        args.push("-ar".into());
        args.push((audio.sample_rate * 1000).to_string());
        if audio.max_bitrate > 0 {
            args.push("-b:a".into());
            args.push(format!("{}k", audio.max_bitrate));
        }
        args.push("-ac".into());
        args.push(audio.channels.to_string());
    }
}

fn push_srtp_output(
    args: &mut Vec<String>,
    controller: IpAddr,
    flow: &OutboundFlow,
    payload_type: u8,
    mtu: Option<u16>,
) {
    args.push("-payload_type".into());
    args.push(payload_type.to_string());
    args.push("-ssrc".into());
    args.push(flow.ssrc.to_string());
    args.extend(["-f", "rtp", "-srtp_out_suite", SRTP_SUITE].map(String::from));
    args.push("-srtp_out_params".into());
    args.push(flow.srtp.to_base64());

    let target = SocketAddr::new(controller, flow.controller_port);
    let mut url = format!("srtp://{target}?rtcpport={}", flow.controller_port);
    if let Some(mtu) = mtu {
        url.push_str(&format!("&pkt_size={mtu}"));
    }
    args.push(url);
}

#[async_trait]
impl MediaTransport for FfmpegTransport {
    async fn start(&self, ctx: TransportContext) -> Result<TransportHandle> {
        let source = ctx.device.video_stream_source(ctx.selected.as_ref()).await?;
        let args = self.command_args(&source, ctx.controller_address, &ctx.video, &ctx.audio, &ctx.start);

        let mut child = Command::new(&self.config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StreamError::Transport(format!("failed to spawn {}: {e}", self.config.binary.display()))
            })?;

        if let Some(stderr) = child.stderr.take() {
            let session_id = ctx.session_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(%session_id, %line, "ffmpeg");
                }
            });
        }

        tracing::info!(
            session_id = %ctx.session_id,
            pid = ?child.id(),
            mode = ?self.config.mode,
            source = %source.url,
            "encoder started"
        );

        Ok(TransportHandle {
            encoder: Some(EncoderProcess::supervise(child, ctx.kill)),
            relay: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::params::{H264Level, H264Profile, SrtpParams};

    fn start_request(codec: AudioCodec) -> StartRequest {
        StartRequest {
            video: VideoParams {
                profile: H264Profile::Main,
                level: H264Level::Level4_0,
                width: 1280,
                height: 720,
                fps: 30,
                max_bitrate: 299,
                payload_type: 99,
                mtu: 1378,
                rtcp_interval: 0.5,
            },
            audio: AudioParams {
                codec,
                channels: 1,
                sample_rate: 16,
                max_bitrate: 24,
                payload_type: 110,
                packet_time: 20,
                rtcp_interval: 5.0,
            },
        }
    }

    fn flow(port: u16, ssrc: u32) -> OutboundFlow {
        OutboundFlow {
            controller_port: port,
            return_port: port + 1000,
            ssrc,
            srtp: SrtpParams::new(vec![0u8; 16], vec![0u8; 14]),
        }
    }

    fn args_for(mode: TransportMode, controller: &str, codec: AudioCodec) -> Vec<String> {
        let transport = FfmpegTransport::new(FfmpegConfig {
            mode,
            ..FfmpegConfig::default()
        });
        let source = MediaSource {
            url: "rtsp://camera/main".into(),
            input_args: vec!["-rtsp_transport".into(), "tcp".into()],
        };
        transport.command_args(
            &source,
            controller.parse().unwrap(),
            &flow(51000, 7),
            &flow(51002, 8),
            &start_request(codec),
        )
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Vec<&'a str> {
        args.windows(2)
            .filter(|w| w[0] == flag)
            .map(|w| w[1].as_str())
            .collect()
    }

    #[test]
    fn input_args_precede_input() {
        let args = args_for(TransportMode::Transcode, "10.0.0.9", AudioCodec::Opus);
        let input = args.iter().position(|a| a == "-i").unwrap();
        let transport = args.iter().position(|a| a == "-rtsp_transport").unwrap();
        assert!(transport < input);
        assert_eq!(args[input + 1], "rtsp://camera/main");
    }

    #[test]
    fn transcode_maps_video_params() {
        let args = args_for(TransportMode::Transcode, "10.0.0.9", AudioCodec::Opus);
        assert_eq!(value_after(&args, "-vcodec"), ["libx264"]);
        assert_eq!(value_after(&args, "-profile:v"), ["main"]);
        assert_eq!(value_after(&args, "-level:v"), ["4.0"]);
        assert_eq!(value_after(&args, "-b:v"), ["299k"]);
        assert_eq!(value_after(&args, "-bufsize"), ["598k"]);
        assert_eq!(value_after(&args, "-vf"), ["scale=1280:720"]);
    }

    #[test]
    fn outputs_carry_payload_types_and_ssrcs() {
        let args = args_for(TransportMode::Transcode, "10.0.0.9", AudioCodec::Opus);
        assert_eq!(value_after(&args, "-payload_type"), ["99", "110"]);
        assert_eq!(value_after(&args, "-ssrc"), ["7", "8"]);
        assert_eq!(
            value_after(&args, "-srtp_out_params"),
            [
                "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
                "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"
            ]
        );
        assert!(args.contains(&"srtp://10.0.0.9:51000?rtcpport=51000&pkt_size=1378".to_string()));
        assert!(args.contains(&"srtp://10.0.0.9:51002?rtcpport=51002".to_string()));
    }

    #[test]
    fn huge_bitrate_saturates_bufsize() {
        let transport = FfmpegTransport::new(FfmpegConfig {
            mode: TransportMode::Transcode,
            ..FfmpegConfig::default()
        });
        let mut start = start_request(AudioCodec::Opus);
        start.video.max_bitrate = u32::MAX;

        let mut args = Vec::new();
        transport.video_codec_args(&start.video, &mut args);
        assert_eq!(value_after(&args, "-bufsize"), [format!("{}k", u32::MAX).as_str()]);
    }

    #[test]
    fn ipv6_destination_is_bracketed() {
        let args = args_for(TransportMode::Transcode, "2001:db8::9", AudioCodec::Opus);
        assert!(args.iter().any(|a| a.starts_with("srtp://[2001:db8::9]:51000?")));
    }

    #[test]
    fn opus_audio() {
        let args = args_for(TransportMode::Transcode, "10.0.0.9", AudioCodec::Opus);
        assert_eq!(value_after(&args, "-acodec"), ["libopus"]);
        assert_eq!(value_after(&args, "-frame_duration"), ["20"]);
        assert_eq!(value_after(&args, "-ar"), ["16000"]);
        assert_eq!(value_after(&args, "-b:a"), ["24k"]);
    }

    #[test]
    fn aac_eld_audio() {
        let args = args_for(TransportMode::Transcode, "10.0.0.9", AudioCodec::AacEld);
        assert_eq!(value_after(&args, "-acodec"), ["libfdk_aac"]);
        assert_eq!(value_after(&args, "-profile:a"), ["aac_eld"]);
    }

    #[test]
    fn passthrough_copies_streams() {
        let args = args_for(TransportMode::Passthrough, "10.0.0.9", AudioCodec::Opus);
        assert_eq!(value_after(&args, "-vcodec"), ["copy"]);
        assert_eq!(value_after(&args, "-acodec"), ["copy"]);
        assert!(value_after(&args, "-b:v").is_empty());
    }
}
