//! One function per `infNFe` section. Child order follows the layout's
//! sequence definitions; the authority rejects out-of-order elements.

use crate::{
    access_key::AccessKey,
    constants::{HOMOLOGATION_RECIPIENT_NAME, MODEL_NFE, PROCESS_VERSION},
    money::Amount,
    tax_id::TaxId,
    types::{
        Environment, InvoiceSeries, IssuerProfile, PaymentMethod, ProductDefaults, TaxRule,
    },
    xml::Element,
};

use super::PricedItem;

const BRAZIL_COUNTRY_CODE: &str = "1058";

pub(super) struct Identification<'a> {
    pub issuer: &'a IssuerProfile,
    pub access_key: &'a AccessKey,
    pub series: InvoiceSeries,
    pub environment: Environment,
    pub emission_type: u8,
    /// `dhEmi`, already formatted with the issuer's offset.
    pub issued_at: &'a str,
}

pub(super) fn ide(id: &Identification<'_>) -> Element {
    Element::new("ide").with_children([
        Element::leaf("cUF", id.issuer.address.uf.ibge_code().to_string()),
        Element::leaf("cNF", id.access_key.nonce()),
        Element::leaf("natOp", clean(&id.issuer.operation_nature, 60)),
        Element::leaf("mod", MODEL_NFE.to_string()),
        Element::leaf("serie", id.series.series().to_string()),
        Element::leaf("nNF", id.series.number().to_string()),
        Element::leaf("dhEmi", id.issued_at),
        // Outgoing operation.
        Element::leaf("tpNF", "1"),
        // Recipient in the same state.
        Element::leaf("idDest", "1"),
        Element::leaf("cMunFG", &id.issuer.address.municipality_code),
        // Portrait DANFE.
        Element::leaf("tpImp", "1"),
        Element::leaf("tpEmis", id.emission_type.to_string()),
        Element::leaf("cDV", id.access_key.check_digit().to_string()),
        Element::leaf("tpAmb", id.environment.code().to_string()),
        // Regular (non-complementary, non-return) document.
        Element::leaf("finNFe", "1"),
        // Sold to the final consumer.
        Element::leaf("indFinal", "1"),
        // Buyer not present: internet sale.
        Element::leaf("indPres", "2"),
        // Sold on the issuer's own site, no intermediary platform.
        Element::leaf("indIntermed", "0"),
        // Issued by the taxpayer's own application.
        Element::leaf("procEmi", "0"),
        Element::leaf("verProc", PROCESS_VERSION),
    ])
}

pub(super) fn emit(issuer: &IssuerProfile) -> Element {
    let address = &issuer.address;
    let ender = Element::new("enderEmit")
        .with_child(Element::leaf("xLgr", clean(&address.street, 60)))
        .with_child(Element::leaf("nro", clean(&address.number, 60)))
        .with_optional_child(
            address
                .complement
                .as_deref()
                .map(|complement| Element::leaf("xCpl", clean(complement, 60))),
        )
        .with_child(Element::leaf("xBairro", clean(&address.district, 60)))
        .with_child(Element::leaf("cMun", &address.municipality_code))
        .with_child(Element::leaf("xMun", clean(&address.municipality, 60)))
        .with_child(Element::leaf("UF", address.uf.to_string()))
        .with_child(Element::leaf("CEP", &address.postal_code))
        .with_child(Element::leaf("cPais", BRAZIL_COUNTRY_CODE))
        .with_child(Element::leaf("xPais", "Brasil"))
        .with_optional_child(
            address
                .phone
                .as_deref()
                .map(|phone| Element::leaf("fone", digits_only(phone))),
        );

    Element::new("emit")
        .with_child(Element::leaf("CNPJ", issuer.cnpj.as_str()))
        .with_child(Element::leaf("xNome", clean(&issuer.legal_name, 60)))
        .with_optional_child(
            issuer
                .trade_name
                .as_deref()
                .map(|name| Element::leaf("xFant", clean(name, 60))),
        )
        .with_child(ender)
        .with_child(Element::leaf("IE", digits_only(&issuer.state_registration)))
        .with_child(Element::leaf("CRT", issuer.tax_regime.code().to_string()))
}

pub(super) fn dest(
    tax_id: &TaxId,
    name: &str,
    email: Option<&str>,
    environment: Environment,
) -> Element {
    let name = match environment {
        Environment::Homologation => HOMOLOGATION_RECIPIENT_NAME.to_string(),
        Environment::Production => clean(name, 60),
    };

    Element::new("dest")
        .with_child(Element::leaf(tax_id.tag(), tax_id.digits()))
        .with_child(Element::leaf("xNome", name))
        // Not a contributor of ICMS.
        .with_child(Element::leaf("indIEDest", "9"))
        .with_optional_child(
            email
                .map(str::trim)
                .filter(|email| !email.is_empty())
                .map(|email| Element::leaf("email", clean(email, 60))),
        )
}

pub(super) fn det(
    item: &PricedItem<'_>,
    products: &ProductDefaults,
    tax: &TaxRule,
    uses_csosn: bool,
) -> Element {
    let sale_item = item.item;
    let code = sale_item
        .code
        .clone()
        .unwrap_or_else(|| item.position.to_string());
    let ncm = sale_item.ncm.as_deref().unwrap_or(&products.ncm);
    let cfop = sale_item.cfop.as_deref().unwrap_or(&products.cfop);
    let quantity = format!("{}.0000", sale_item.quantity);
    let unit_price = item.unit_price.to_string();

    let prod = Element::new("prod").with_children([
        Element::leaf("cProd", clean(&code, 60)),
        Element::leaf("cEAN", "SEM GTIN"),
        Element::leaf("xProd", clean(&sale_item.name, 120)),
        Element::leaf("NCM", ncm),
        Element::leaf("CFOP", cfop),
        Element::leaf("uCom", &products.unit),
        Element::leaf("qCom", &quantity),
        Element::leaf("vUnCom", &unit_price),
        Element::leaf("vProd", item.total.to_string()),
        Element::leaf("cEANTrib", "SEM GTIN"),
        Element::leaf("uTrib", &products.unit),
        Element::leaf("qTrib", &quantity),
        Element::leaf("vUnTrib", &unit_price),
        // Counts towards the document total.
        Element::leaf("indTot", "1"),
    ]);

    Element::new("det")
        .with_attribute("nItem", item.position.to_string())
        .with_child(prod)
        .with_child(imposto(tax, uses_csosn))
}

fn imposto(tax: &TaxRule, uses_csosn: bool) -> Element {
    let icms = if uses_csosn {
        Element::new("ICMSSN102")
            .with_child(Element::leaf("orig", tax.origin.to_string()))
            .with_child(Element::leaf("CSOSN", &tax.icms_csosn))
    } else {
        Element::new("ICMS40")
            .with_child(Element::leaf("orig", tax.origin.to_string()))
            .with_child(Element::leaf("CST", &tax.icms_cst))
    };

    Element::new("imposto")
        .with_child(Element::new("ICMS").with_child(icms))
        .with_child(
            Element::new("PIS")
                .with_child(Element::new("PISNT").with_child(Element::leaf("CST", &tax.pis_cst))),
        )
        .with_child(Element::new("COFINS").with_child(
            Element::new("COFINSNT").with_child(Element::leaf("CST", &tax.cofins_cst)),
        ))
}

pub(super) fn total(products_total: Amount) -> Element {
    let zero = Amount::ZERO.to_string();
    let products = products_total.to_string();

    let icms_tot = Element::new("ICMSTot").with_children(
        [
            ("vBC", &zero),
            ("vICMS", &zero),
            ("vICMSDeson", &zero),
            ("vFCP", &zero),
            ("vBCST", &zero),
            ("vST", &zero),
            ("vFCPST", &zero),
            ("vFCPSTRet", &zero),
            ("vProd", &products),
            ("vFrete", &zero),
            ("vSeg", &zero),
            ("vDesc", &zero),
            ("vII", &zero),
            ("vIPI", &zero),
            ("vIPIDevol", &zero),
            ("vPIS", &zero),
            ("vCOFINS", &zero),
            ("vOutro", &zero),
            ("vNF", &products),
        ]
        .into_iter()
        .map(|(name, value)| Element::leaf(name, value.as_str())),
    );

    Element::new("total").with_child(icms_tot)
}

pub(super) fn transp() -> Element {
    // No freight.
    Element::new("transp").with_child(Element::leaf("modFrete", "9"))
}

pub(super) fn pag(method: PaymentMethod, amount: Amount) -> Element {
    let detail = Element::new("detPag")
        // Paid upfront.
        .with_child(Element::leaf("indPag", "0"))
        .with_child(Element::leaf("tPag", method.code()))
        .with_optional_child(
            matches!(method, PaymentMethod::Other).then(|| Element::leaf("xPag", "Outros")),
        )
        .with_child(Element::leaf("vPag", amount.to_string()))
        .with_optional_child(method.is_card().then(|| {
            // Card processed by a gateway not integrated with the invoicing system.
            Element::new("card").with_child(Element::leaf("tpIntegra", "2"))
        }));

    Element::new("pag").with_child(detail)
}

pub(super) fn inf_adic(note: &str) -> Element {
    Element::new("infAdic").with_child(Element::leaf("infCpl", clean(note, 5000)))
}

/// Collapse whitespace runs and cut to `max_chars`. Text fields may not start
/// or end with whitespace or contain line breaks.
pub(super) fn clean(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(max_chars) {
        Some((cut, _)) => collapsed[..cut].trim_end().to_string(),
        None => collapsed,
    }
}

fn digits_only(text: &str) -> String {
    text.chars().filter(char::is_ascii_digit).collect()
}
