/// Namespace of every NF-e document and tax-authority message.
pub const NFE_NAMESPACE: &str = "http://www.portalfiscal.inf.br/nfe";
/// Layout version carried in `versao` attributes.
pub const LAYOUT_VERSION: &str = "4.00";
/// Fiscal document model code for the NF-e.
pub const MODEL_NFE: u8 = 55;
/// `tpEmis` for normal (non-contingency) emission.
pub const EMISSION_TYPE_NORMAL: u8 = 1;
/// Prefix of the `Id` attribute of `infNFe`.
pub const DOCUMENT_ID_PREFIX: &str = "NFe";

/// Application identifier written to `verProc`. At most 20 characters.
pub const PROCESS_VERSION: &str = concat!("nfe-emitter ", env!("CARGO_PKG_VERSION"));

/// Recipient name required by the authority for documents issued in the
/// homologation environment.
pub const HOMOLOGATION_RECIPIENT_NAME: &str =
    "NF-E EMITIDA EM AMBIENTE DE HOMOLOGACAO - SEM VALOR FISCAL";

// XML-DSig
pub const XMLDSIG_NAMESPACE: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const C14N_ALGORITHM: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
pub const ENVELOPED_SIGNATURE_TRANSFORM: &str =
    "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

// SOAP 1.2
pub const SOAP12_NAMESPACE: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const WSDL_NAMESPACE_BASE: &str = "http://www.portalfiscal.inf.br/nfe/wsdl";

// Authority status codes with a fixed meaning across services.
pub const STATUS_BATCH_RECEIVED: &str = "103";
pub const STATUS_BATCH_PROCESSED: &str = "104";
pub const STATUS_BATCH_PROCESSING: &str = "105";
pub const STATUS_SERVICE_IN_OPERATION: &str = "107";
pub const STATUS_DOCUMENT_NOT_FOUND: &str = "217";
