use clap::{Args, Parser, Subcommand};
use glam::Vec3;
use gsplat_lib::common::DEFAULT_CLIPPING_RADIUS;
use gsplat_lib::structures::{SENTINEL_INDEX, SENTINEL_POSITION};
use gsplat_lib::ply::{self, PlyData};
use gsplat_lib::{
    prepare_cloud, CameraData, GpuContext, LoaderConfig, OffscreenTarget, RasterizerConfig,
    SplatCloud, SplatRasterizer,
};
use std::error::Error;
use std::path::PathBuf;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[derive(Parser, Debug)]
#[command(
    name = "PLY Splat Sorter",
    version = "1.0",
    author = "Denis Avvakumov",
    about = "Inspects, depth-sorts and renders PLY splat clouds on a headless GPU"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(
        short = 'a',
        long = "async",
        default_value = "false",
        global = true,
        help = "Load the input file asynchronously."
    )]
    async_mode: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the header, bounds and culling summary of a file.
    Inspect(InputArgs),
    /// Depth-sort the splats for one camera and print the nearest ones.
    Sort {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        camera: CameraArgs,
        #[arg(long, default_value = "10", help = "Number of sorted splats to print.")]
        show: usize,
    },
    /// Render one frame off-screen and report its statistics.
    Render {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        camera: CameraArgs,
        #[arg(long, default_value = "1280")]
        width: u32,
        #[arg(long, default_value = "720")]
        height: u32,
    },
}

#[derive(Args, Debug)]
struct InputArgs {
    #[arg(
        short = 'i',
        long = "input",
        value_name = "INPUT",
        help = "Path to the input PLY file."
    )]
    input: PathBuf,

    #[arg(
        short = 'r',
        long = "radius",
        value_name = "RADIUS",
        default_value_t = DEFAULT_CLIPPING_RADIUS,
        help = "Splats farther than this from the origin are culled."
    )]
    radius: f32,
}

#[derive(Args, Debug)]
struct CameraArgs {
    #[arg(long, value_parser = parse_vec3, default_value = "0,0,5", help = "Camera position as x,y,z.")]
    eye: Vec3,

    #[arg(long, value_parser = parse_vec3, default_value = "0,0,0", help = "Point the camera looks at.")]
    target: Vec3,

    #[arg(long, default_value = "60", help = "Vertical field of view in degrees.")]
    fov: f32,
}

impl CameraArgs {
    fn camera(&self) -> CameraData {
        CameraData::look_at(self.eye, self.target, Vec3::Y, self.fov.to_radians())
    }
}

fn parse_vec3(s: &str) -> Result<Vec3, String> {
    let parts = s
        .split(',')
        .map(|p| p.trim().parse::<f32>().map_err(|e| format!("'{}': {}", p, e)))
        .collect::<Result<Vec<_>, _>>()?;
    match parts.as_slice() {
        [x, y, z] => Ok(Vec3::new(*x, *y, *z)),
        _ => Err(format!("expected x,y,z, got '{}'", s)),
    }
}

fn read(input: &InputArgs, async_mode: bool) -> CliResult<PlyData> {
    let max_size = LoaderConfig::default().max_file_size;
    let data = if async_mode {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        rt.block_on(ply::read_file_async(&input.input, max_size))?
    } else {
        ply::read_file(&input.input, max_size)?
    };
    Ok(data)
}

fn prepare(input: &InputArgs, data: PlyData) -> CliResult<SplatCloud> {
    let config = LoaderConfig {
        clipping_radius: input.radius,
        ..Default::default()
    };
    Ok(prepare_cloud(data, &config)?)
}

fn load(input: &InputArgs, async_mode: bool) -> CliResult<SplatCloud> {
    let start = Instant::now();
    let cloud = prepare(input, read(input, async_mode)?)?;
    println!(
        "Loaded {} splats from '{}' in {} ms",
        cloud.len(),
        input.input.display(),
        start.elapsed().as_millis()
    );
    Ok(cloud)
}

fn inspect(input: &InputArgs, async_mode: bool) -> CliResult<()> {
    let data = read(input, async_mode)?;
    let header = &data.header;
    println!(
        "Vertices: {} | Stride: {} bytes | Fields: {}",
        header.vertex_count,
        header.stride,
        header.properties.len()
    );
    println!("{}", header.field_names().collect::<Vec<_>>().join(" "));

    let cloud = prepare(input, data)?;
    let culled = cloud
        .records
        .iter()
        .filter(|r| r.pos == SENTINEL_POSITION)
        .count();
    println!("Culled beyond radius {}: {}", input.radius, culled);
    if let Some(bounds) = cloud.bounds().map(|b| b.flip_z()) {
        println!(
            "Bounds center: {:?} | extents: {:?}",
            bounds.center(),
            bounds.extents()
        );
    }
    Ok(())
}

fn rasterizer(cloud: SplatCloud) -> CliResult<SplatRasterizer> {
    let ctx = GpuContext::headless_blocking()?;
    let mut rasterizer = SplatRasterizer::new(ctx, RasterizerConfig::default());
    rasterizer.activate_cloud(cloud)?;
    Ok(rasterizer)
}

fn sort(input: &InputArgs, camera: &CameraArgs, show: usize, async_mode: bool) -> CliResult<()> {
    let cloud = load(input, async_mode)?;
    let mut rasterizer = rasterizer(cloud)?;

    let start = Instant::now();
    let sorted = rasterizer.sort_for_camera(&camera.camera())?;
    let Some(resources) = rasterizer.resources() else {
        println!("Nothing to sort.");
        return Ok(());
    };
    let (keys, values) = resources.sort.read_back(rasterizer.context())?;
    println!(
        "{} {} splats ({} slots) in {} ms",
        if sorted { "Sorted" } else { "Kept upload order of" },
        resources.count(),
        resources.capacity(),
        start.elapsed().as_millis()
    );

    for (key, index) in keys.iter().zip(&values).take(show.min(resources.count() as usize)) {
        println!("{:>10} depth {:.4}", index, key);
    }

    let live = resources.count() as usize;
    let padding_last = values[live..].iter().all(|&v| v == SENTINEL_INDEX);
    println!("Padding after live splats: {}", if padding_last { "ok" } else { "BROKEN" });
    if !padding_last {
        return Err("sort left padding slots among live splats".into());
    }
    Ok(())
}

fn render(
    input: &InputArgs,
    camera: &CameraArgs,
    width: u32,
    height: u32,
    async_mode: bool,
) -> CliResult<()> {
    let cloud = load(input, async_mode)?;
    let mut rasterizer = rasterizer(cloud)?;
    let target = OffscreenTarget::new(
        rasterizer.context(),
        width,
        height,
        rasterizer.config().color_format,
    );

    let start = Instant::now();
    let stats = rasterizer.render_for_camera(&camera.camera(), &target.target())?;
    let pixels = target.read_pixels(rasterizer.context())?;
    let covered = pixels.chunks_exact(4).filter(|px| px[3] > 0).count();
    println!("Frame Time: {} ms", start.elapsed().as_millis());
    println!(
        "Instances: {} | Capacity: {} | Sorted: {} | Covered pixels: {}/{}",
        stats.instance_count,
        stats.capacity,
        stats.sorted,
        covered,
        width * height
    );
    Ok(())
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Inspect(input) => inspect(input, cli.async_mode),
        Command::Sort {
            input,
            camera,
            show,
        } => sort(input, camera, *show, cli.async_mode),
        Command::Render {
            input,
            camera,
            width,
            height,
        } => render(input, camera, *width, *height, cli.async_mode),
    }
}
