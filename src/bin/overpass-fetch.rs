use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use overpass_features::{
    config::{Config, ServerList, TagVocabulary},
    models::{BoundingBox, TagFilter, TemporalSelector},
    overpass::OverpassClient,
    pipeline::{FeatureRequest, Pipeline},
    region::{NominatimGeocoder, RegionRequest},
    sink::GeoJsonSink,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "overpass-fetch")]
#[command(about = "Fetch tagged OSM features from Overpass as GeoJSON layers")]
struct Cli {
    /// JSON file with the Overpass endpoints to choose from
    #[arg(long, global = true)]
    servers: Option<PathBuf>,

    /// Index of the endpoint to query
    #[arg(long, global = true)]
    server_index: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the Overpass QL query for a request without running it
    Compile(RequestArgs),
    /// Run a request and write one GeoJSON file per geometry type
    Fetch {
        #[command(flatten)]
        request: RequestArgs,
        /// Output directory
        #[arg(long)]
        output: Option<PathBuf>,
        /// Replace existing output files
        #[arg(long)]
        overwrite: bool,
    },
    /// List the keys and values of a tag vocabulary file
    Vocabulary {
        /// Vocabulary JSON file
        path: PathBuf,
    },
    /// List the configured Overpass endpoints
    Servers,
}

#[derive(Args)]
struct RequestArgs {
    /// Tag key, e.g. "amenity"
    #[arg(long)]
    key: String,
    /// Accepted values; omit for any value
    #[arg(long = "value")]
    values: Vec<String>,
    /// Regex-escape the values before building the filter
    #[arg(long)]
    escape: bool,
    /// Bounding box as min_lat,min_lon,max_lat,max_lon
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true, conflicts_with = "region")]
    bbox: Option<Vec<f64>>,
    /// Place name to geocode into an administrative area
    #[arg(long)]
    region: Option<String>,
    /// Query the database as of this date (YYYY-MM-DD or RFC 3339)
    #[arg(long)]
    date: Option<String>,
    /// Prefix of the output layer names
    #[arg(long, default_value = "osm")]
    prefix: String,
    /// Vocabulary JSON file to validate the tag choice against
    #[arg(long)]
    vocabulary: Option<PathBuf>,
}

impl RequestArgs {
    fn into_request(self) -> anyhow::Result<FeatureRequest> {
        let tag = match &self.vocabulary {
            Some(path) => TagVocabulary::load(path)?.filter_for(&self.key, &self.values)?,
            None if self.values.is_empty() => TagFilter::wildcard(&self.key),
            None if self.escape => TagFilter::any_of_escaped(&self.key, &self.values)?,
            None => TagFilter::any_of(&self.key, self.values.iter().cloned())?,
        };

        let region = match (self.bbox, self.region) {
            (Some(c), None) => match c[..] {
                [min_lat, min_lon, max_lat, max_lon] => {
                    RegionRequest::BoundingBox(BoundingBox::new(min_lat, min_lon, max_lat, max_lon))
                }
                _ => anyhow::bail!("--bbox takes exactly four numbers"),
            },
            (None, Some(name)) => RegionRequest::Named(name),
            _ => anyhow::bail!("pass either --bbox or --region"),
        };

        let mut request = FeatureRequest::new(tag, region).with_layer_prefix(self.prefix);
        if let Some(date) = self.date {
            request = request.as_of(TemporalSelector::parse(&date)?);
        }

        Ok(request)
    }
}

fn build_pipeline(config: &Config) -> anyhow::Result<Pipeline> {
    let geocoder = NominatimGeocoder::new(config.geocoder.clone())?;
    let client = OverpassClient::new(&config.overpass)?;
    info!("Using Overpass endpoint {}", client.url());
    Ok(Pipeline::new(
        Arc::new(geocoder),
        Arc::new(client),
        config.output.clone(),
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::from_env();
    if let Some(path) = &cli.servers {
        config = config.with_servers(ServerList::load(path)?);
    }
    if let Some(index) = cli.server_index {
        config.overpass.server_index = index;
    }

    match cli.command {
        Commands::Compile(args) => {
            config.validate()?;
            let request = args.into_request()?;
            let query = build_pipeline(&config)?.compile(&request).await?;
            println!("{}", query);
        }

        Commands::Fetch {
            request,
            output,
            overwrite,
        } => {
            if let Some(output) = output {
                config.output.output_dir = output;
            }
            config.output.overwrite |= overwrite;
            config.validate()?;

            let request = request.into_request()?;
            let pipeline = build_pipeline(&config)?;
            let mut sink = GeoJsonSink::new(config.output.clone())?;

            let report = pipeline.run(&request, &mut sink).await?;

            for layer in &report.layers {
                for failure in &layer.element_failures {
                    warn!(
                        "{} {}: {}",
                        failure.osm_type.as_str(),
                        failure.osm_id,
                        failure.error
                    );
                }
            }
            for path in sink.written() {
                info!("Wrote {:?}", path);
            }
            info!("{}", report.summary());
        }

        Commands::Vocabulary { path } => {
            let vocabulary = TagVocabulary::load(&path)?;
            for (key, entry) in vocabulary.keys() {
                let any = if entry.allows_any { " (any value allowed)" } else { "" };
                println!("{}{}: {}", key, any, entry.values.join(", "));
            }
        }

        Commands::Servers => {
            for (index, server) in config.overpass.servers.iter().enumerate() {
                let marker = if index == config.overpass.server_index { "*" } else { " " };
                println!("{} [{}] {}", marker, index, server);
            }
        }
    }

    Ok(())
}
