//! Flash DFU-capable USB devices.

mod args;

use std::io::Write;
use std::path::Path;
use std::process::ExitCode;

use log::info;
use udfu::image::RAW_IMAGE_ADDRESS;
use udfu::usb;
use udfu::{
    DfuEngine, DfuEvents, DfuFile, Error, NamedMemory, RawMemory, Segment, TargetImage, Version,
    parse_dfu_file, parse_intel_hex, parse_srec,
};

use args::Args;

const USAGE: &str = "\
usage: udfu -i <file> [-d <vid>:<pid>] [-v <major>.<minor>]

  -i <file>           firmware image (.dfu, .hex, .s19/.srec, or raw binary)
  -d <vid>:<pid>      device to flash, hexadecimal; ignored for .dfu files,
                      whose suffix is authoritative
  -v <major>.<minor>  firmware version carried by the image; the download is
                      skipped when a device in application mode already runs
                      it or newer. Ignored for .dfu files, whose suffix is
                      authoritative
  -h                  show this help
";

fn main() -> ExitCode {
    env_logger::init();

    let args = match Args::parse() {
        Ok(args) => args,
        Err(error) => {
            eprintln!("error: {error}");
            eprint!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };
    if args.help {
        print!("{USAGE}");
        return ExitCode::SUCCESS;
    }
    if args.image.is_none() {
        eprintln!("error: no image given");
        eprint!("{USAGE}");
        return ExitCode::FAILURE;
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

enum LoadedImage {
    Dfu(DfuFile),
    Memory(RawMemory),
}

fn load_image(path: &Path) -> Result<LoadedImage, Error> {
    let data = std::fs::read(path)?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    Ok(match extension.as_deref() {
        Some("dfu") => LoadedImage::Dfu(parse_dfu_file(&data)?),
        Some("hex" | "ihex" | "ihx") => LoadedImage::Memory(parse_intel_hex(&data)?),
        Some("srec" | "s19" | "s28" | "s37" | "mot") => LoadedImage::Memory(parse_srec(&data)?),
        _ => {
            let mut memory = RawMemory::new();
            memory.try_add(Segment::new(RAW_IMAGE_ADDRESS, data));
            LoadedImage::Memory(memory)
        }
    })
}

/// Progress meter and device-error reporter for the terminal.
#[derive(Default)]
struct ConsoleEvents {
    last_percent: Option<u8>,
}

impl DfuEvents for ConsoleEvents {
    fn progress(&mut self, percent: u8, transferred: usize) {
        if self.last_percent == Some(percent) {
            return;
        }
        self.last_percent = Some(percent);
        eprint!("\r{percent:3}% ({transferred} bytes)");
        let _ = std::io::stderr().flush();
        if percent == 100 {
            eprintln!();
        }
    }

    fn device_error(&mut self, message: &str) {
        eprintln!("device error: {message}");
    }
}

fn run(args: &Args) -> Result<(), Error> {
    let path = args.image.as_deref().unwrap_or(Path::new(""));
    let image = load_image(path)?;

    // a DFU suffix is authoritative about the device it targets
    let (vid, pid) = match (&image, args.device) {
        (LoadedImage::Dfu(file), _) if file.suffix.vendor_id != 0xFFFF => {
            (file.suffix.vendor_id, file.suffix.product_id)
        }
        (_, Some(device)) => device,
        _ => {
            return Err(Error::Io(std::io::Error::other(
                "no device given, pass -d <vid>:<pid>",
            )));
        }
    };

    let mut engine = open_engine(vid, pid)?;
    let mut events = ConsoleEvents::default();

    if engine.state()?.is_app_state() {
        // a .dfu suffix is authoritative about the version too; -v only
        // applies to images that cannot carry one
        let image_version = match &image {
            LoadedImage::Dfu(file) => (file.suffix.device_version != 0xFFFF)
                .then(|| Version::from_bcd(file.suffix.device_version)),
            LoadedImage::Memory(_) => args.version.map(|(major, minor)| Version(major, minor)),
        };
        if let Some(image_version) = image_version {
            let running = engine.identification().product_version;
            if image_version <= running {
                println!("device already runs {running}, nothing to do");
                return Ok(());
            }
        }
        info!("device is in application mode, reconfiguring");
        engine.reconfigure()?;
        engine = open_engine(vid, pid)?;
    }

    match &image {
        LoadedImage::Dfu(file) => {
            engine.check_file(file)?;
            if file.suffix.is_dfuse() {
                engine.download_dfuse(&file.targets, &mut events)?;
            } else {
                engine.download(&plain_payload(file)?, &mut events)?;
            }
        }
        LoadedImage::Memory(memory) => {
            if engine.is_dfuse() {
                let targets = [TargetImage {
                    alt_setting: 0,
                    image: NamedMemory::new("", memory.clone()),
                }];
                engine.download_dfuse(&targets, &mut events)?;
            } else {
                engine.download(&contiguous_payload(memory)?, &mut events)?;
            }
        }
    }

    engine.manifest()?;
    println!("done");
    Ok(())
}

fn open_engine(vid: u16, pid: u16) -> Result<DfuEngine<usb::UsbTransport>, Error> {
    let candidate = usb::find_device(vid, pid)?;
    let (transport, descriptor, identification) = candidate.open()?;
    Ok(DfuEngine::new(transport, descriptor, identification)?)
}

fn plain_payload(file: &DfuFile) -> Result<Vec<u8>, Error> {
    let memory = file
        .targets
        .first()
        .map(|t| &t.image.memory)
        .ok_or_else(|| Error::Io(std::io::Error::other("DFU file carries no image")))?;
    contiguous_payload(memory)
}

fn contiguous_payload(memory: &RawMemory) -> Result<Vec<u8>, Error> {
    match memory.segments() {
        [segment] => Ok(segment.data.clone()),
        _ => Err(Error::Io(std::io::Error::other(
            "image is not contiguous, plain DFU downloads need a single segment",
        ))),
    }
}
